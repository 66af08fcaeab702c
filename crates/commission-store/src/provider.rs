use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use commission_core::{
    AccountStatus, PaymentProvider, TransferError, TransferReceipt, TransferRequest,
};
use tokio::sync::Mutex;
use uuid::Uuid;

/// What the next `create_transfer` call does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedTransfer {
    Accept,
    Reject(String),
    Indeterminate(String),
    /// The provider moves the money but the response never arrives.
    LostResponse,
    /// Never answers; used to exercise the caller's timeout.
    Hang,
}

/// Payment provider double driven by a queue of scripted responses. Honors
/// idempotency keys the way a real provider does: a key that already produced
/// a transfer returns the same transfer again.
#[derive(Default)]
pub struct ScriptedPaymentProvider {
    accounts: Mutex<HashMap<Uuid, AccountStatus>>,
    script: Mutex<VecDeque<ScriptedTransfer>>,
    requests: Mutex<Vec<TransferRequest>>,
    transfers: Mutex<HashMap<String, TransferReceipt>>,
}

impl ScriptedPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_account(&self, beneficiary_id: Uuid, status: AccountStatus) {
        self.accounts.lock().await.insert(beneficiary_id, status);
    }

    pub async fn push(&self, response: ScriptedTransfer) {
        self.script.lock().await.push_back(response);
    }

    pub async fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().await.clone()
    }

    /// Number of distinct transfers that actually moved money.
    pub async fn transfers_created(&self) -> usize {
        self.transfers.lock().await.len()
    }

    async fn record_transfer(&self, key: &str) -> TransferReceipt {
        let mut transfers = self.transfers.lock().await;
        let receipt = TransferReceipt {
            transfer_id: format!("tr_{}", transfers.len() + 1),
        };
        transfers.insert(key.to_string(), receipt.clone());
        receipt
    }
}

#[async_trait]
impl PaymentProvider for ScriptedPaymentProvider {
    async fn account_status(
        &self,
        beneficiary_id: Uuid,
    ) -> Result<Option<AccountStatus>, TransferError> {
        Ok(self.accounts.lock().await.get(&beneficiary_id).cloned())
    }

    async fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, TransferError> {
        self.requests.lock().await.push(request.clone());

        if let Some(existing) = self
            .transfers
            .lock()
            .await
            .get(&request.idempotency_key)
            .cloned()
        {
            return Ok(existing);
        }

        let next = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or(ScriptedTransfer::Accept);

        match next {
            ScriptedTransfer::Accept => Ok(self.record_transfer(&request.idempotency_key).await),
            ScriptedTransfer::Reject(reason) => Err(TransferError::Rejected(reason)),
            ScriptedTransfer::Indeterminate(reason) => Err(TransferError::Indeterminate(reason)),
            ScriptedTransfer::LostResponse => {
                self.record_transfer(&request.idempotency_key).await;
                Err(TransferError::Indeterminate("connection reset".to_string()))
            }
            ScriptedTransfer::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    fn request(key: &str) -> TransferRequest {
        TransferRequest {
            amount: Decimal::new(2000, 2),
            destination_reference: "acct_1".to_string(),
            idempotency_key: key.to_string(),
            payout_id: Uuid::new_v4(),
            beneficiary_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn same_key_returns_same_transfer() {
        let provider = ScriptedPaymentProvider::new();
        provider.push(ScriptedTransfer::LostResponse).await;

        let first = provider.create_transfer(&request("p1")).await;
        assert!(matches!(first, Err(TransferError::Indeterminate(_))));

        let second = provider.create_transfer(&request("p1")).await.unwrap();
        assert_eq!(second.transfer_id, "tr_1");
        assert_eq!(provider.transfers_created().await, 1);
        assert_eq!(provider.requests().await.len(), 2);
    }

    #[tokio::test]
    async fn rejection_moves_no_money() {
        let provider = ScriptedPaymentProvider::new();
        provider
            .push(ScriptedTransfer::Reject("insufficient funds".to_string()))
            .await;

        let result = provider.create_transfer(&request("p2")).await;
        assert_eq!(
            result,
            Err(TransferError::Rejected("insufficient funds".to_string()))
        );
        assert_eq!(provider.transfers_created().await, 0);
    }
}
