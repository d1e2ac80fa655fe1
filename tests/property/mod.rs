// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests Module

mod command_parsing;
mod store_sequencing;
