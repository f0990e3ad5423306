use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("payment provider unavailable: {0}")]
    Unavailable(String),
}

/// Handle returned when a payment is started. Settlement happens out of band and
/// is reported back through `Engine::record_payment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub reference: String,
    pub amount: u64,
}

/// The only surface the engine sees of a payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(&self, appointment_id: Ulid, amount: u64) -> Result<PaymentIntent, PaymentError>;
    async fn refund(&self, reference: &str, amount: u64) -> Result<(), PaymentError>;
}

/// Gateway for deployments that settle payments at the clinic. Issues local
/// references and accepts every refund.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineGateway;

#[async_trait]
impl PaymentGateway for OfflineGateway {
    async fn create_intent(&self, appointment_id: Ulid, amount: u64) -> Result<PaymentIntent, PaymentError> {
        Ok(PaymentIntent {
            reference: format!("offline_{appointment_id}"),
            amount,
        })
    }

    async fn refund(&self, _reference: &str, _amount: u64) -> Result<(), PaymentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_gateway_references_appointment() {
        let id = Ulid::new();
        let intent = OfflineGateway.create_intent(id, 5000).await.unwrap();
        assert_eq!(intent.amount, 5000);
        assert!(intent.reference.ends_with(&id.to_string()));
        assert!(OfflineGateway.refund(&intent.reference, 5000).await.is_ok());
    }
}
