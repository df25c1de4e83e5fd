// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics: structured logging and trap reports.

pub mod log;
pub mod report;
