// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities, mocks, and helpers for integration tests

pub mod helpers;
pub mod mock_hec;
