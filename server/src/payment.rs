//! Payment gateway boundary.
//!
//! Only the intent/refund surface is specified; gateway internals live
//! elsewhere. The mock gateway dedups charges by reference (the saga's
//! step idempotency key), which is what makes payment retries safe.

use async_trait::async_trait;
use booking_rush_core::{Money, PaymentId, UserId};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Why a charge or refund failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    /// The card was declined.
    #[error("card declined: {reason}")]
    Declined {
        /// Issuer's reason.
        reason: String,
    },
    /// Not enough funds.
    #[error("insufficient funds")]
    InsufficientFunds,
    /// The gateway did not answer in time.
    #[error("gateway timeout")]
    Timeout,
    /// Gateway-side failure.
    #[error("gateway error: {message}")]
    Gateway {
        /// Gateway's message.
        message: String,
    },
}

impl PaymentError {
    /// Whether retrying the same charge could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Gateway { .. })
    }
}

/// Abstraction over payment processors.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charges `amount` for `user_id`. `reference` is the caller's
    /// idempotency key: charging the same reference twice must capture at
    /// most once and return the original payment id.
    ///
    /// # Errors
    ///
    /// A [`PaymentError`] describing the decline or infrastructure
    /// failure.
    async fn charge(
        &self,
        reference: &str,
        user_id: UserId,
        amount: Money,
        currency: &str,
    ) -> Result<PaymentId, PaymentError>;

    /// Refunds a captured payment. Refunding an already-refunded payment
    /// is a no-op success.
    ///
    /// # Errors
    ///
    /// A [`PaymentError`] for unknown payments or infrastructure failure.
    async fn refund(&self, payment_id: &PaymentId, amount: Money) -> Result<(), PaymentError>;
}

#[derive(Default)]
struct MockState {
    charges: HashMap<String, PaymentId>,
    refunded: HashMap<String, Money>,
    fail_next: Vec<PaymentError>,
}

/// Development/test gateway: approves everything unless told otherwise.
#[derive(Default)]
pub struct MockPaymentGateway {
    state: Mutex<MockState>,
}

impl MockPaymentGateway {
    /// A gateway that approves every charge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next charge or refund attempt.
    pub fn fail_next(&self, error: PaymentError) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next.push(error);
        }
    }

    /// Amount refunded against a payment id, if any.
    #[must_use]
    pub fn refunded(&self, payment_id: &PaymentId) -> Option<Money> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.refunded.get(payment_id.as_str()).copied())
    }

    /// Number of distinct charges captured.
    #[must_use]
    pub fn charge_count(&self) -> usize {
        self.state.lock().map(|state| state.charges.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn charge(
        &self,
        reference: &str,
        user_id: UserId,
        amount: Money,
        currency: &str,
    ) -> Result<PaymentId, PaymentError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PaymentError::Gateway {
                message: "gateway state poisoned".to_string(),
            })?;

        if let Some(payment_id) = state.charges.get(reference) {
            // Same reference: the earlier capture stands.
            return Ok(payment_id.clone());
        }
        if let Some(error) = state.fail_next.pop() {
            return Err(error);
        }

        let payment_id = PaymentId::new(format!("pay_{}", Uuid::new_v4().simple()));
        state.charges.insert(reference.to_string(), payment_id.clone());
        tracing::debug!(
            reference,
            %user_id,
            amount = %amount,
            currency,
            payment_id = %payment_id,
            "mock gateway captured payment"
        );
        Ok(payment_id)
    }

    async fn refund(&self, payment_id: &PaymentId, amount: Money) -> Result<(), PaymentError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PaymentError::Gateway {
                message: "gateway state poisoned".to_string(),
            })?;
        if let Some(error) = state.fail_next.pop() {
            return Err(error);
        }
        state.refunded.insert(payment_id.as_str().to_string(), amount);
        tracing::debug!(payment_id = %payment_id, amount = %amount, "mock gateway refunded");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn charge_is_idempotent_by_reference() {
        let gateway = MockPaymentGateway::new();
        let user = UserId::new();

        let first = gateway
            .charge("saga-1:process-payment", user, Money::from_cents(200), "THB")
            .await
            .unwrap();
        let second = gateway
            .charge("saga-1:process-payment", user, Money::from_cents(200), "THB")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(gateway.charge_count(), 1);
    }

    #[tokio::test]
    async fn queued_failures_surface_once() {
        let gateway = MockPaymentGateway::new();
        gateway.fail_next(PaymentError::Declined {
            reason: "do not honor".to_string(),
        });

        let err = gateway
            .charge("ref-1", UserId::new(), Money::from_cents(100), "THB")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());

        assert!(
            gateway
                .charge("ref-1", UserId::new(), Money::from_cents(100), "THB")
                .await
                .is_ok()
        );
    }
}
