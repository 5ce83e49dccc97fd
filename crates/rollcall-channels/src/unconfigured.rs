//! Notifier used when no `[notifier]` section is configured

use async_trait::async_trait;
use rollcall_channel_api::{ChannelError, ChannelResult, Notifier, OutboundAlert};
use tracing::debug;

/// Fails every send, so escalation stages never advance without a real
/// delivery path
#[derive(Debug, Default)]
pub struct UnconfiguredNotifier;

#[async_trait]
impl Notifier for UnconfiguredNotifier {
    async fn send_direct(&self, contact_id: &str, alert: &OutboundAlert) -> ChannelResult<()> {
        debug!(contact_id, alert_id = %alert.alert_id, "No notifier configured");
        Err(ChannelError::NotConfigured("notifier".into()))
    }

    async fn send_admin(&self, alert: &OutboundAlert) -> ChannelResult<()> {
        debug!(alert_id = %alert.alert_id, "No notifier configured");
        Err(ChannelError::NotConfigured("notifier".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_api::{AlertKind, Audience};
    use rollcall_util::{AlertId, StudentId};

    #[tokio::test]
    async fn every_send_fails() {
        let alert = OutboundAlert {
            alert_id: AlertId::new(),
            student_id: StudentId::new(1),
            student_name: "김유나".into(),
            kind: AlertKind::CameraOff,
            stage: 1,
            audience: Audience::Admin,
            text: String::new(),
            choices: vec![],
        };
        let notifier = UnconfiguredNotifier;
        assert!(matches!(
            notifier.send_admin(&alert).await,
            Err(ChannelError::NotConfigured(_))
        ));
        assert!(notifier.send_direct("1001", &alert).await.is_err());
    }
}
