use crate::devices::{Actuator, Switch, RAIN_THRESHOLD_TOPIC};
use crate::errors::{Error, Result};
use crate::metrics::COMMANDS_PUBLISHED_TOTAL;
use crate::mqtt::Publisher;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Confirmation that the broker accepted a command. Says nothing about
/// whether the device has applied it yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReceipt {
    pub device: String,
    pub slug: String,
    pub topic: String,
    pub status: Switch,
}

/// Forwards dashboard commands to the broker.
///
/// Command history is written only when the device reports its new state
/// (see [`crate::bridge::Bridge::on_device_state`]), never here.
#[derive(Clone)]
pub struct CommandGateway {
    publisher: Arc<dyn Publisher>,
}

impl CommandGateway {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    pub fn is_connected(&self) -> bool {
        self.publisher.is_connected()
    }

    pub async fn issue(&self, device: Option<&str>, status: Option<&str>) -> Result<CommandReceipt> {
        let device = device
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::Validation("device is required".to_string()))?;
        let status = status
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Validation("status is required".to_string()))?;

        let actuator = Actuator::resolve(device)
            .ok_or_else(|| Error::Validation(format!("unknown device {:?}", device)))?;
        let status = Switch::parse(status)
            .ok_or_else(|| Error::Validation(format!("status must be ON or OFF, got {:?}", status)))?;

        let topic = actuator.command_topic();
        self.publisher
            .publish(&topic, status.as_str().as_bytes(), false)
            .await?;
        COMMANDS_PUBLISHED_TOTAL.inc();
        info!("Sent {} to {} on {}", status, actuator, topic);

        Ok(CommandReceipt {
            device: actuator.display_name().to_string(),
            slug: actuator.slug().to_string(),
            topic,
            status,
        })
    }

    /// Publishes the rain alert threshold, retained so a device that boots
    /// later still picks it up.
    pub async fn set_rain_threshold(&self, threshold: f64) -> Result<()> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(Error::Validation(format!(
                "threshold must be a non-negative number, got {}",
                threshold
            )));
        }

        self.publisher
            .publish(RAIN_THRESHOLD_TOPIC, threshold.to_string().as_bytes(), true)
            .await?;
        info!("Published rain threshold {}", threshold);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::RecordingPublisher;

    fn gateway() -> (CommandGateway, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::new());
        (CommandGateway::new(publisher.clone()), publisher)
    }

    #[test]
    fn test_issue_publishes_non_retained() {
        tokio_test::block_on(async {
            let (gateway, publisher) = gateway();
            let receipt = gateway.issue(Some("Quạt"), Some("on")).await.unwrap();

            assert_eq!(receipt.slug, "led2");
            assert_eq!(receipt.topic, "control/led2");
            assert_eq!(receipt.status, Switch::On);

            let published = publisher.published();
            assert_eq!(published.len(), 1);
            assert_eq!(published[0].payload_str(), "ON");
            assert!(!published[0].retain);
        });
    }

    #[test]
    fn test_issue_accepts_slug() {
        tokio_test::block_on(async {
            let (gateway, _) = gateway();
            let receipt = gateway.issue(Some("LED3"), Some("OFF")).await.unwrap();
            assert_eq!(receipt.device, "Điều hòa");
        });
    }

    #[test]
    fn test_issue_validation() {
        tokio_test::block_on(async {
            let (gateway, publisher) = gateway();

            for (device, status) in [
                (None, Some("ON")),
                (Some("Đèn"), None),
                (Some("  "), Some("ON")),
                (Some("Tivi"), Some("ON")),
                (Some("Đèn"), Some("TOGGLE")),
            ] {
                let err = gateway.issue(device, status).await.unwrap_err();
                assert!(matches!(err, Error::Validation(_)), "{:?}", err);
            }
            assert!(publisher.published().is_empty());
        });
    }

    #[test]
    fn test_issue_while_disconnected() {
        tokio_test::block_on(async {
            let (gateway, publisher) = gateway();
            publisher.set_connected(false);

            let err = gateway.issue(Some("Đèn"), Some("ON")).await.unwrap_err();
            assert!(matches!(err, Error::TransportUnavailable(_)));
        });
    }

    #[test]
    fn test_rain_threshold_is_retained() {
        tokio_test::block_on(async {
            let (gateway, publisher) = gateway();
            gateway.set_rain_threshold(12.5).await.unwrap();
            assert!(gateway.set_rain_threshold(-1.0).await.is_err());
            assert!(gateway.set_rain_threshold(f64::NAN).await.is_err());

            let published = publisher.published();
            assert_eq!(published.len(), 1);
            assert_eq!(published[0].topic, "config/rain_threshold");
            assert_eq!(published[0].payload_str(), "12.5");
            assert!(published[0].retain);
        });
    }
}
