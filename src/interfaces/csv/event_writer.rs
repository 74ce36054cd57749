use crate::domain::outcome::SubscriptionEvent;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct EventRow<'a> {
    subscription_id: &'a str,
    event_type: &'a str,
    transaction_hash: &'a str,
    amount: String,
    error_message: &'a str,
}

impl<'a> From<&'a SubscriptionEvent> for EventRow<'a> {
    fn from(event: &'a SubscriptionEvent) -> Self {
        Self {
            subscription_id: event.subscription_id.as_str(),
            event_type: event.event_type.as_str(),
            transaction_hash: event.transaction_hash.as_deref().unwrap_or_default(),
            amount: event.amount.normalize().to_string(),
            error_message: event.error_message.as_deref().unwrap_or_default(),
        }
    }
}

/// Writes the outcome report: one row per recorded event.
pub struct EventWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> EventWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new().from_writer(sink),
        }
    }

    pub fn write_events<'a>(&mut self, events: impl IntoIterator<Item = &'a SubscriptionEvent>) -> Result<()> {
        for event in events {
            self.writer.serialize(EventRow::from(event))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::SubscriptionId;
    use crate::domain::outcome::{FailureKind, RedemptionOutcome};
    use rust_decimal_macros::dec;

    #[test]
    fn test_writes_header_and_rows() {
        let due = "2026-01-01T00:00:00Z".parse().unwrap();
        let events = vec![
            SubscriptionEvent::from_outcome(
                SubscriptionId::new("S1"),
                &RedemptionOutcome::Settled {
                    transaction_hash: "0xabc".to_string(),
                },
                dec!(100.000000),
                due,
            ),
            SubscriptionEvent::from_outcome(
                SubscriptionId::new("S2"),
                &RedemptionOutcome::failed(FailureKind::Validation, "delegation expired, retry later"),
                dec!(0.5),
                due,
            ),
        ];

        let mut out = Vec::new();
        EventWriter::new(&mut out).write_events(&events).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "subscription_id,event_type,transaction_hash,amount,error_message"
        );
        assert_eq!(lines[1], "S1,redeemed,0xabc,100,");
        assert_eq!(
            lines[2],
            "S2,fail_validation,,0.5,\"delegation expired, retry later\""
        );
    }
}
