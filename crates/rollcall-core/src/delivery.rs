//! Outbound alert delivery
//!
//! The engine plans alerts synchronously; the daemon performs the sends on
//! separate tasks and hands each result back through
//! [`crate::PresenceEngine::complete_delivery`]. A stage is committed only
//! after the send succeeded.

use chrono::{DateTime, Local};
use rollcall_api::AlertKind;
use rollcall_channel_api::{ChannelError, ChannelResult, Notifier, OutboundAlert};
use rollcall_util::{AlertId, StudentId};
use tracing::debug;

use crate::DeliveryTicket;

/// What the engine needs back to settle a send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub student_id: StudentId,
    pub kind: AlertKind,
    pub alert_id: AlertId,
    pub ticket: DeliveryTicket,
    /// Tick instant the alert was planned at; committed as last_notified_at
    pub planned_at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryIntent {
    pub receipt: DeliveryReceipt,
    pub alert: OutboundAlert,
    pub contact_id: Option<String>,
    /// The student already has this stage's message; set by an earlier
    /// attempt or by [`deliver`] itself
    pub student_reached: bool,
}

/// Send one alert to every recipient of its audience.
///
/// Succeeds only if every recipient was reached. A student who was reached
/// before a later recipient failed is recorded on the intent.
pub async fn deliver(notifier: &dyn Notifier, intent: &mut DeliveryIntent) -> ChannelResult<()> {
    let alert = &intent.alert;

    if alert.audience.includes_student() && !intent.student_reached {
        let contact_id = intent
            .contact_id
            .as_deref()
            .ok_or(ChannelError::MissingContact)?;
        notifier.send_direct(contact_id, alert).await?;
        intent.student_reached = true;
        debug!(alert_id = %alert.alert_id, contact_id, "Direct alert sent");
    }

    if alert.audience.includes_admin() {
        notifier.send_admin(alert).await?;
        debug!(alert_id = %alert.alert_id, "Admin alert sent");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_api::Audience;
    use rollcall_channel_api::{Delivery, MockNotifier};

    fn intent(audience: Audience, contact_id: Option<&str>) -> DeliveryIntent {
        let alert_id = AlertId::new();
        DeliveryIntent {
            receipt: DeliveryReceipt {
                student_id: StudentId::new(1),
                kind: AlertKind::CameraOff,
                alert_id,
                ticket: DeliveryTicket {
                    epoch: 0,
                    expected_stage: 1,
                },
                planned_at: Local.with_ymd_and_hms(2026, 10, 15, 13, 35, 0).unwrap(),
            },
            alert: OutboundAlert {
                alert_id,
                student_id: StudentId::new(1),
                student_name: "김유나".into(),
                kind: AlertKind::CameraOff,
                stage: 2,
                audience,
                text: "[2차 알림]".into(),
                choices: vec![],
            },
            contact_id: contact_id.map(str::to_string),
            student_reached: false,
        }
    }

    #[tokio::test]
    async fn dual_audience_reaches_both() {
        let notifier = MockNotifier::new();
        deliver(&notifier, &mut intent(Audience::StudentAndAdmin, Some("1001")))
            .await
            .unwrap();

        let targets: Vec<Delivery> = notifier.sent().into_iter().map(|(d, _)| d).collect();
        assert_eq!(targets, vec![Delivery::Direct("1001".into()), Delivery::Admin]);
    }

    #[tokio::test]
    async fn missing_contact_fails_student_audience() {
        let notifier = MockNotifier::new();
        let err = deliver(&notifier, &mut intent(Audience::Student, None))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::MissingContact));
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_reported() {
        let notifier = MockNotifier::new();
        notifier.set_failing(true);
        assert!(deliver(&notifier, &mut intent(Audience::Admin, None)).await.is_err());
    }

    #[tokio::test]
    async fn admin_failure_keeps_the_student_send() {
        let notifier = MockNotifier::new();
        notifier.set_admin_failing(true);
        let mut dual = intent(Audience::StudentAndAdmin, Some("1001"));

        assert!(deliver(&notifier, &mut dual).await.is_err());
        assert!(dual.student_reached);

        // The retry only goes to the admin
        notifier.set_admin_failing(false);
        deliver(&notifier, &mut dual).await.unwrap();
        let targets: Vec<Delivery> = notifier.sent().into_iter().map(|(d, _)| d).collect();
        assert_eq!(targets, vec![Delivery::Direct("1001".into()), Delivery::Admin]);
    }
}
