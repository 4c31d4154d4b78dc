//! Builds a [`Notification`] from an enriched canonical event.

use notiq_core::{CanonicalEvent, EventKind};
use notiq_enrich::{EnrichedCompany, EnrichedPerson};
use serde_json::Value;

use crate::notification::{ActionButton, Notification, Section, Status};

/// Assembles notifications from events plus whatever enrichment the blend
/// produced. Enrichment is always optional: an event with no company or
/// person data still renders a complete notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotificationBuilder;

impl NotificationBuilder {
    /// Creates the builder.
    pub fn new() -> Self {
        Self
    }

    /// Builds the notification.
    pub fn build(
        &self,
        event: &CanonicalEvent,
        company: Option<&EnrichedCompany>,
        person: Option<&EnrichedPerson>,
    ) -> Notification {
        let company_display = company
            .and_then(|c| c.name.clone())
            .or_else(|| {
                let name = event.customer.company_name.trim();
                if name.is_empty() { None } else { Some(name.to_string()) }
            })
            .unwrap_or_else(|| "Individual".to_string());

        let mut notification =
            Notification::new(title_for(event.kind, &company_display), status_for(event.kind));

        notification.push_section(event_section(event));
        notification.push_section(customer_section(event, &company_display, person));
        if let Some(company) = company {
            notification.push_section(company_section(company));
        }
        notification.push_section(cross_reference_section(event));

        if let Some(action) = order_action(event) {
            notification.push_action(action);
        }

        notification
    }
}

fn status_for(kind: EventKind) -> Status {
    match kind {
        EventKind::PaymentSuccess => Status::Success,
        EventKind::PaymentFailure => Status::Failed,
        EventKind::SubscriptionCancelled | EventKind::TrialEnding => Status::Warning,
        EventKind::SubscriptionCreated
        | EventKind::SubscriptionRenewed
        | EventKind::GenericUpdate => Status::Info,
    }
}

fn title_for(kind: EventKind, company: &str) -> String {
    match kind {
        EventKind::PaymentSuccess => format!("Payment received from {company}"),
        EventKind::PaymentFailure => format!("Payment failed for {company}"),
        EventKind::SubscriptionCreated => format!("New subscription for {company}"),
        EventKind::SubscriptionRenewed => format!("Subscription renewed for {company}"),
        EventKind::SubscriptionCancelled => format!("Subscription cancelled for {company}"),
        EventKind::TrialEnding => format!("Trial ending for {company}"),
        EventKind::GenericUpdate => format!("Update for {company}"),
    }
}

fn event_section(event: &CanonicalEvent) -> Section {
    let mut section = Section::new("Event Details");
    section.add_field("Event", event.kind.label());
    section.add_field("Provider", capitalize(event.provider.as_str()));
    section.add_field("Amount", event.amount.display(&event.currency));

    let plan = event
        .subscription
        .as_ref()
        .map(|s| s.plan_name.as_str())
        .filter(|p| !p.is_empty())
        .or_else(|| event.metadata("plan_name"));
    if let Some(plan) = plan {
        section.add_field("Plan", plan);
    }
    if let Some(sub) = &event.subscription {
        if !sub.id.is_empty() {
            section.add_field("Subscription", format!("#{}", sub.id));
        }
    }
    if let Some(txn) = event.metadata("transaction_id") {
        section.add_field("Transaction", format!("#{txn}"));
    }
    if let Some(order) = event.metadata("order_number") {
        section.add_field("Order", format!("#{order}"));
    }
    if let Some(reason) = event.metadata("failure_reason") {
        section.add_field("Failure Reason", reason);
    }

    section
}

fn customer_section(
    event: &CanonicalEvent,
    company_display: &str,
    person: Option<&EnrichedPerson>,
) -> Section {
    let mut section = Section::new("Customer");
    section.add_field("Company", company_display);

    let contact = person
        .and_then(EnrichedPerson::display_name)
        .unwrap_or_else(|| event.customer.display_name());
    if !contact.is_empty() {
        section.add_field("Contact", contact);
    }
    if !event.customer.email.is_empty() {
        section.add_field("Email", &event.customer.email);
    }

    if let Some(person) = person {
        if let Some(position) = &person.position {
            section.add_field("Title", position);
        }
        if let Some(seniority) = &person.seniority {
            section.add_field("Seniority", capitalize(seniority));
        }
        if let Some(linkedin) = person.social_handles.get("linkedin") {
            section.add_field("LinkedIn", linkedin);
        }
    }

    if let Some(orders) = event.metadata("orders_count") {
        section.add_field("Total Orders", orders);
    }
    if let Some(spent) = event.metadata("total_spent") {
        section.add_field("Total Spent", format!("${spent}"));
    }

    section
}

fn company_section(company: &EnrichedCompany) -> Section {
    let mut section = Section::new("Company");
    if let Some(industry) = company.brand_info.get("industry").and_then(Value::as_str) {
        section.add_field("Industry", industry);
    }
    if let Some(founded) = company.brand_info.get("year_founded") {
        if let Some(year) = founded.as_i64() {
            section.add_field("Founded", year.to_string());
        }
    }
    if let Some(description) = company.brand_info.get("description").and_then(Value::as_str) {
        section.add_field("About", description);
    }
    section
}

fn cross_reference_section(event: &CanonicalEvent) -> Section {
    let mut section = Section::new("Related Transactions");
    if let Some(order_ref) = event.metadata("shopify_order_ref") {
        section.add_field("Related Order", format!("Shopify Order #{order_ref}"));
    }
    if let Some(payment_ref) = event.metadata("related_payment_ref") {
        section.add_field("Related Payment", format!("Chargify Payment #{payment_ref}"));
    }
    section
}

fn order_action(event: &CanonicalEvent) -> Option<ActionButton> {
    let shop_domain = event.metadata("shop_domain")?;
    event.metadata("order_number")?;
    Some(ActionButton::new(
        "View order",
        format!("https://{shop_domain}/admin/orders/{}", event.external_id),
    ))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
