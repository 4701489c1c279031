// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod machine_id;
pub mod process;
pub mod services;
pub mod signals;
pub mod store;

pub use machine_id::resolve_machine_id;
pub use process::ProcessSupervisor;
pub use services::builtin_catalog;
pub use signals::TerminationSignals;
