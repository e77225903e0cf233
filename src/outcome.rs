// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Processing Outcomes
//!
//! What a handler (or the framework on its behalf) decided about one delivery.
//! The acknowledgement behaviour matches on it exhaustively to pick the broker
//! action.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed successfully
    Ack,
    /// Processed successfully, deliver the message again after the delay
    Retry(Duration),
    /// Processing failed; `requeue` asks for a retry
    Nack { requeue: bool },
    /// Processing refused the message
    Reject {
        reason: RejectReason,
        error: Option<String>,
        requeue: bool,
    },
}

/// Why a message was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Handler-level rejection, subject to the retry policy when requeued
    Failed(String),
    /// The payload was empty
    EmptyBody,
    /// The payload could not be decoded
    UnsupportedFormat,
    /// The message matched no binding
    Unroutable,
}

impl RejectReason {
    /// Structural failures are never retried.
    pub fn is_structural(&self) -> bool {
        matches!(self, RejectReason::EmptyBody | RejectReason::UnsupportedFormat)
    }
}

impl Outcome {
    pub fn retry_after(delay: Duration) -> Self {
        Outcome::Retry(delay)
    }

    /// Transient failure, retried per the queue's policy.
    pub fn nack() -> Self {
        Outcome::Nack { requeue: true }
    }

    pub fn reject(reason: &str, requeue: bool) -> Self {
        Outcome::Reject {
            reason: RejectReason::Failed(reason.to_owned()),
            error: None,
            requeue,
        }
    }

    pub fn empty_body() -> Self {
        Outcome::Reject {
            reason: RejectReason::EmptyBody,
            error: None,
            requeue: false,
        }
    }

    pub fn unsupported_format(error: impl ToString) -> Self {
        Outcome::Reject {
            reason: RejectReason::UnsupportedFormat,
            error: Some(error.to_string()),
            requeue: false,
        }
    }

    pub fn unroutable() -> Self {
        Outcome::Reject {
            reason: RejectReason::Unroutable,
            error: None,
            requeue: false,
        }
    }
}
