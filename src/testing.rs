// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::cell::Cell;

thread_local! {
    static PINNED_CORE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Pins the calling thread to a fixed allocation slot
///
/// Tests use this to make scan cursors and page hints deterministic.
pub fn pin_core(core: usize) {
    PINNED_CORE.with(|pinned| pinned.set(Some(core)));
}

/// Removes the pin installed by [`pin_core`]
pub fn unpin_core() {
    PINNED_CORE.with(|pinned| pinned.set(None));
}

pub(crate) fn pinned_core() -> Option<usize> {
    PINNED_CORE.with(|pinned| pinned.get())
}

pub fn init_tracing() {
    use std::sync::Once;

    static TRACING: Once = Once::new();

    // make sure this only gets initialized once
    TRACING.call_once(|| {
        let format = tracing_subscriber::fmt::format().compact();

        let env_filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(tracing::Level::TRACE.into())
            .with_env_var("HOMA_LOG")
            .from_env()
            .unwrap();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .event_format(format)
            .with_test_writer()
            .init();
    });
}
