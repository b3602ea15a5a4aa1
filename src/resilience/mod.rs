// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection retry. Atomic cache ops and backend writes are never retried
//! here: a failed scan is picked up by the next scheduled pass.

pub mod retry;
