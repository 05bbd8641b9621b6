//! Billing event classification
//!
//! Stripe delivers several event types that all mean one of a handful of
//! things to the entitlement engine. The classifier inspects a verified
//! envelope and reduces it to a semantic category plus the identifying facts
//! the rest of the pipeline needs.
//!
//! The envelope is parsed with serde_json instead of async-stripe's typed
//! `Event`: Stripe API versions newer than the crate's pinned version add
//! fields that break typed deserialization, and classification only needs a
//! few stable fields anyway.

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

/// Raw webhook envelope, parsed from the verified payload
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    pub object: Value,
    #[serde(default)]
    pub previous_attributes: Option<Value>,
}

/// Identifying facts extracted from an event payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionFacts {
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub subscription_id: Option<String>,
    pub price_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
}

/// Semantic category of a billing event
#[derive(Debug, Clone, PartialEq)]
pub enum EventClass {
    NewSubscription(SubscriptionFacts),
    PlanChange(SubscriptionFacts),
    Renewal(SubscriptionFacts),
    Cancellation(SubscriptionFacts),
    /// Acknowledged and dropped; not an error
    Ignored,
}

/// Classify a verified webhook envelope.
///
/// Renewals arrive on two redundant paths (`customer.subscription.updated`
/// with a period rollover, and `invoice.payment_succeeded` for a
/// subscription cycle); downstream transitions must stay idempotent so the
/// pair cannot double-reset credits.
pub fn classify(envelope: &WebhookEnvelope) -> EventClass {
    let object = &envelope.data.object;

    match envelope.event_type.as_str() {
        "checkout.session.completed" => {
            if object.get("mode").and_then(Value::as_str) == Some("subscription") {
                EventClass::NewSubscription(checkout_facts(object))
            } else {
                EventClass::Ignored
            }
        }
        "customer.subscription.created" => EventClass::NewSubscription(subscription_facts(object)),
        "customer.subscription.updated" => {
            let period_rolled = envelope
                .data
                .previous_attributes
                .as_ref()
                .map(|prev| prev.get("current_period_start").is_some())
                .unwrap_or(false);

            if period_rolled {
                EventClass::Renewal(subscription_facts(object))
            } else {
                EventClass::PlanChange(subscription_facts(object))
            }
        }
        "customer.subscription.deleted" => EventClass::Cancellation(subscription_facts(object)),
        "invoice.payment_succeeded" => {
            if object.get("billing_reason").and_then(Value::as_str) == Some("subscription_cycle") {
                EventClass::Renewal(invoice_facts(object))
            } else {
                EventClass::Ignored
            }
        }
        _ => EventClass::Ignored,
    }
}

/// Customer field is either a bare id string or an expanded object
fn customer_id_of(object: &Value) -> Option<String> {
    match object.get("customer") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Object(customer)) => customer
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn timestamp_of(value: Option<&Value>) -> Option<OffsetDateTime> {
    value
        .and_then(Value::as_i64)
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

fn subscription_facts(object: &Value) -> SubscriptionFacts {
    SubscriptionFacts {
        customer_id: customer_id_of(object),
        email: None,
        subscription_id: object.get("id").and_then(Value::as_str).map(str::to_string),
        price_id: object
            .pointer("/items/data/0/price/id")
            .and_then(Value::as_str)
            .map(str::to_string),
        current_period_start: timestamp_of(object.get("current_period_start")),
        current_period_end: timestamp_of(object.get("current_period_end")),
    }
}

fn checkout_facts(object: &Value) -> SubscriptionFacts {
    SubscriptionFacts {
        customer_id: customer_id_of(object),
        email: object
            .pointer("/customer_details/email")
            .or_else(|| object.get("customer_email"))
            .and_then(Value::as_str)
            .map(str::to_string),
        subscription_id: object
            .get("subscription")
            .and_then(Value::as_str)
            .map(str::to_string),
        // Checkout sessions do not carry the price; the handler fills it in
        // from the subscription object.
        price_id: None,
        current_period_start: None,
        current_period_end: None,
    }
}

fn invoice_facts(object: &Value) -> SubscriptionFacts {
    SubscriptionFacts {
        customer_id: customer_id_of(object),
        email: object
            .get("customer_email")
            .and_then(Value::as_str)
            .map(str::to_string),
        subscription_id: object
            .get("subscription")
            .and_then(Value::as_str)
            .map(str::to_string),
        price_id: object
            .pointer("/lines/data/0/price/id")
            .and_then(Value::as_str)
            .map(str::to_string),
        current_period_start: timestamp_of(object.pointer("/lines/data/0/period/start")),
        current_period_end: timestamp_of(object.pointer("/lines/data/0/period/end")),
    }
}
