use anyhow::Result;
use console::style;

use unify_auth_bridge::OrganisationId;
use unify_core::{ExtractedContact, ExtractedEvent, SyncSnapshot};

use crate::commands::ready_client;
use crate::ui;

pub async fn run(org: &OrganisationId, json: bool) -> Result<()> {
    let client = ready_client().await?;
    let snapshot = client.get_snapshot(org).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    print_snapshot(org, &snapshot);
    Ok(())
}

fn print_snapshot(org: &OrganisationId, snapshot: &SyncSnapshot) {
    let Some(synced) = snapshot.last_sync_at else {
        println!();
        ui::info(&format!("No snapshot yet for {}. Run `unify sync` first.", org));
        println!();
        return;
    };
    println!();
    ui::info(&format!(
        "{} as of {}",
        style(org).bold(),
        synced.format("%Y-%m-%d %H:%M UTC")
    ));

    ui::section("EVENTS");
    if snapshot.events.is_empty() {
        println!("  {}", style("none found").dim());
    }
    for event in &snapshot.events {
        println!("  {}", event_line(event));
    }

    ui::section("CONTACTS");
    if snapshot.contacts.is_empty() {
        println!("  {}", style("none found").dim());
    }
    for contact in &snapshot.contacts {
        println!("  {}", contact_line(contact));
    }

    if !snapshot.insights.is_empty() {
        ui::section("INSIGHTS");
        for insight in &snapshot.insights {
            println!("  • {}", insight);
        }
    }

    if !snapshot.documents.is_empty() {
        ui::section("DOCUMENTS");
        for doc in &snapshot.documents {
            println!(
                "  {:<40} {:<14} {}",
                doc.title,
                doc.category.as_str(),
                style(doc.link.as_deref().unwrap_or("")).dim()
            );
        }
    }
    println!();
}

fn event_line(event: &ExtractedEvent) -> String {
    let when = match event.parsed_start() {
        Some(date) => date.format("%a %d %b %Y").to_string(),
        None => event.start_date.clone(),
    };
    let mut line = format!("{:<16} {}", when, event.title);
    if let Some(venue) = &event.venue {
        line.push_str(&format!(" @ {}", venue));
    }
    line
}

fn contact_line(contact: &ExtractedContact) -> String {
    let kind = format!("{:?}", contact.contact_type).to_lowercase();
    let mut line = format!("{:<28} {:<10}", contact.name, kind);
    if let Some(email) = &contact.email {
        line.push_str(&format!(" {}", email));
    }
    if let Some(phone) = &contact.phone {
        line.push_str(&format!(" {}", phone));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use unify_core::{ContactType, EventType};

    #[test]
    fn test_event_line_formats_iso_dates() {
        let event = ExtractedEvent {
            title: "Charity Iftar".to_string(),
            description: String::new(),
            start_date: "2025-03-14".to_string(),
            end_date: None,
            event_type: EventType::default(),
            venue: Some("Exam Hall".to_string()),
            expected_attendance: None,
            budget_estimate: None,
            tags: Vec::new(),
            source_document_id: None,
            source_subject: None,
            confidence: 0.9,
        };
        assert_eq!(event_line(&event), "Fri 14 Mar 2025  Charity Iftar @ Exam Hall");

        let undated = ExtractedEvent {
            start_date: "TBD".to_string(),
            venue: None,
            ..event
        };
        assert!(event_line(&undated).starts_with("TBD "));
    }

    #[test]
    fn test_contact_line() {
        let contact = ExtractedContact {
            name: "Halal Bites".to_string(),
            contact_type: ContactType::Vendor,
            email: Some("orders@halalbites.ie".to_string()),
            phone: None,
            organisation: None,
            description: String::new(),
            tags: Vec::new(),
            confidence: 0.8,
        };
        let line = contact_line(&contact);
        assert!(line.starts_with("Halal Bites"));
        assert!(line.contains("vendor"));
        assert!(line.ends_with("orders@halalbites.ie"));
    }
}
