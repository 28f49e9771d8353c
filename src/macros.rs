// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Ensures a condition holds, otherwise evaluates the `otherwise` expression
///
/// This is used to avoid heavily-nested `if` statements on paths that mostly
/// bail out early.
macro_rules! ensure {
    ($cond:expr, continue) => {
        if !($cond) {
            continue;
        }
    };
    ($cond:expr, break $($label:lifetime)? $($expr:expr)?) => {
        if !($cond) {
            break $($label)? $($expr)?;
        }
    };
    ($cond:expr, return $($expr:expr)?) => {
        if !($cond) {
            return $($expr)?;
        }
    };
    ($cond:expr $(,)?) => {
        ensure!($cond, return);
    };
    ($cond:expr, $otherwise:expr $(,)?) => {
        if !($cond) {
            return $otherwise;
        }
    };
}
