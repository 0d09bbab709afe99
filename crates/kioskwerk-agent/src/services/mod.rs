// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Startup services: where the agent keeps its state and how it reads its
// configuration.

pub mod config;
pub mod data_dir;
