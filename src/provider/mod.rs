//! Outbound payment processor adapter (§6.2). `PaymentProvider` is the
//! seam the saga calls through; `MockProvider` is the in-memory
//! implementation tests and local/dev mode inject.

use crate::errors::{CoreError, CoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct HoldResult {
    pub payment_intent_id: String,
    pub charge_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransferResult {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReversalResult {
    pub reversal_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct RefundResult {
    pub refund_id: String,
}

/// Every call carries `idempotency_key = eventId + "-" + actionSuffix` so
/// retries are safe; implementations must treat replays as no-ops.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_hold(
        &self,
        idempotency_key: &str,
        amount_cents: i64,
        payment_method_id: &str,
    ) -> CoreResult<HoldResult>;

    async fn capture(&self, idempotency_key: &str, payment_intent_id: &str) -> CoreResult<()>;

    async fn transfer(
        &self,
        idempotency_key: &str,
        amount_cents: i64,
        destination_account: &str,
        source_charge: &str,
        transfer_group: &str,
    ) -> CoreResult<TransferResult>;

    async fn cancel(&self, idempotency_key: &str, payment_intent_id: &str, reason: &str) -> CoreResult<()>;

    async fn reverse_transfer(
        &self,
        idempotency_key: &str,
        transfer_id: &str,
        amount_cents: i64,
    ) -> CoreResult<ReversalResult>;

    async fn refund(
        &self,
        idempotency_key: &str,
        payment_intent_id: &str,
        amount_cents: i64,
    ) -> CoreResult<RefundResult>;
}

/// In-memory provider for local mode and tests. Idempotency is honored by
/// keying every side-effecting call's result cache off `idempotency_key`.
#[derive(Default)]
pub struct MockProvider {
    holds: Mutex<HashMap<String, HoldResult>>,
    transfers: Mutex<HashMap<String, TransferResult>>,
    reversals: Mutex<HashMap<String, ReversalResult>>,
    refunds: Mutex<HashMap<String, RefundResult>>,
    pub fail_on_key: Mutex<Option<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: make the next call using this exact idempotency key return
    /// a retryable provider failure, to exercise the saga's crash-window paths.
    pub fn fail_next(&self, idempotency_key: &str) {
        *self.fail_on_key.lock().unwrap() = Some(idempotency_key.to_string());
    }

    fn maybe_fail(&self, idempotency_key: &str) -> CoreResult<()> {
        let mut guard = self.fail_on_key.lock().unwrap();
        if guard.as_deref() == Some(idempotency_key) {
            *guard = None;
            return Err(CoreError::ProviderFailure(format!(
                "injected failure for {idempotency_key}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn create_hold(
        &self,
        idempotency_key: &str,
        _amount_cents: i64,
        _payment_method_id: &str,
    ) -> CoreResult<HoldResult> {
        self.maybe_fail(idempotency_key)?;
        let mut holds = self.holds.lock().unwrap();
        if let Some(existing) = holds.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let result = HoldResult {
            payment_intent_id: format!("pi_{idempotency_key}"),
            charge_id: format!("ch_{idempotency_key}"),
        };
        holds.insert(idempotency_key.to_string(), result.clone());
        Ok(result)
    }

    async fn capture(&self, idempotency_key: &str, _payment_intent_id: &str) -> CoreResult<()> {
        self.maybe_fail(idempotency_key)?;
        Ok(())
    }

    async fn transfer(
        &self,
        idempotency_key: &str,
        _amount_cents: i64,
        _destination_account: &str,
        _source_charge: &str,
        _transfer_group: &str,
    ) -> CoreResult<TransferResult> {
        self.maybe_fail(idempotency_key)?;
        let mut transfers = self.transfers.lock().unwrap();
        if let Some(existing) = transfers.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let result = TransferResult {
            transfer_id: format!("tr_{idempotency_key}"),
        };
        transfers.insert(idempotency_key.to_string(), result.clone());
        Ok(result)
    }

    async fn cancel(&self, idempotency_key: &str, _payment_intent_id: &str, _reason: &str) -> CoreResult<()> {
        self.maybe_fail(idempotency_key)?;
        Ok(())
    }

    async fn reverse_transfer(
        &self,
        idempotency_key: &str,
        _transfer_id: &str,
        _amount_cents: i64,
    ) -> CoreResult<ReversalResult> {
        self.maybe_fail(idempotency_key)?;
        let mut reversals = self.reversals.lock().unwrap();
        if let Some(existing) = reversals.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let result = ReversalResult {
            reversal_id: format!("rv_{idempotency_key}"),
        };
        reversals.insert(idempotency_key.to_string(), result.clone());
        Ok(result)
    }

    async fn refund(
        &self,
        idempotency_key: &str,
        _payment_intent_id: &str,
        _amount_cents: i64,
    ) -> CoreResult<RefundResult> {
        self.maybe_fail(idempotency_key)?;
        let mut refunds = self.refunds.lock().unwrap();
        if let Some(existing) = refunds.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let result = RefundResult {
            refund_id: format!("re_{idempotency_key}"),
        };
        refunds.insert(idempotency_key.to_string(), result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_hold_is_idempotent() {
        let provider = MockProvider::new();
        let a = provider.create_hold("evt1-hold", 1000, "pm_1").await.unwrap();
        let b = provider.create_hold("evt1-hold", 1000, "pm_1").await.unwrap();
        assert_eq!(a.payment_intent_id, b.payment_intent_id);
    }

    #[tokio::test]
    async fn injected_failure_surfaces_once() {
        let provider = MockProvider::new();
        provider.fail_next("evt2-hold");
        assert!(provider.create_hold("evt2-hold", 1000, "pm_1").await.is_err());
        assert!(provider.create_hold("evt2-hold", 1000, "pm_1").await.is_ok());
    }
}
