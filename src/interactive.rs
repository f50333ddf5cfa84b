use crate::cli::Action;
use crate::coordinator::{CertificateIssued, DnsRecord, OrderCreated, VerificationResult};
use crate::dns::normalize_domain;
use anyhow::{Context, Error};
use crossterm::style::Stylize;
use inquire::validator::Validation;
use inquire::{Select, Text};
use std::io::IsTerminal;
use strum::VariantArray;

/// Prompts are only shown if all standard streams are attached to a terminal
pub fn is_interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal() && std::io::stderr().is_terminal()
}

pub fn ask_action() -> Result<Action, Error> {
    Select::new("What do you want to do?", Action::VARIANTS.to_vec())
        .with_help_message("Run create first, publish the record, then verify and finish")
        .prompt()
        .context("No answer to action prompt")
}

pub fn ask_domain() -> Result<String, Error> {
    Text::new("Domain name:")
        .with_placeholder("example.com")
        .with_help_message("Wildcards like *.example.com are supported")
        .with_validator(|input: &str| {
            if input.trim().is_empty() {
                return Ok(Validation::Invalid("Domain cannot be empty".into()));
            }
            Ok(match normalize_domain(input) {
                Ok(_) => Validation::Valid,
                Err(e) => Validation::Invalid(e.to_string().into()),
            })
        })
        .prompt()
        .map(|domain| domain.trim().to_string())
        .context("No answer to domain prompt")
}

/// Asks for the operator email on first use. The answer is stored in the configuration file.
pub fn ask_email() -> Result<String, Error> {
    println!(
        "{}",
        "No email is configured yet. The CA uses it as account contact, and certstep names the account key after it."
            .blue()
    );
    Text::new("Email:")
        .with_placeholder("email@example.com")
        .with_validator(|input: &str| {
            // Lax validation. The CA may apply stricter requirements.
            let address = input.trim();
            Ok(match address.split_once('@') {
                Some((local, domain)) if !local.is_empty() && domain.contains('.') => Validation::Valid,
                _ => Validation::Invalid(format!("{address} does not look like an email address").into()),
            })
        })
        .prompt()
        .map(|email| email.trim().to_string())
        .context("No answer to email prompt")
}

fn format_record_table(record: &DnsRecord) -> String {
    let name_width = record.name.len().max("NAME".len());
    let type_width = record.typ.len().max("TYPE".len());
    format!(
        "{:<type_width$}  {:<name_width$}  {}\n{:<type_width$}  {:<name_width$}  {}",
        "TYPE",
        "NAME",
        "RECORD",
        record.typ.to_uppercase(),
        record.name,
        record.record
    )
}

pub fn format_order_created(created: &OrderCreated) -> String {
    format!(
        "Order created for {}. Publish this DNS record, then run verify:\n\n{}\n",
        created.domain,
        format_record_table(&created.dns)
    )
}

pub fn print_order_created(created: &OrderCreated) {
    println!("{}", format_order_created(created));
}

pub fn print_verification(result: &VerificationResult) {
    if result.matched {
        println!(
            "{}",
            format!("The TXT record for {} is visible, run finish next.", result.domain).green()
        );
    } else {
        println!(
            "{}",
            format!(
                "The TXT record for {} was not found or has a different value. Expected:\n\n{}\n",
                result.domain,
                format_record_table(&result.dns)
            )
            .yellow()
        );
    }
}

pub fn format_certificate_issued(issued: &CertificateIssued) -> String {
    format!(
        "Certificate for {} issued.\n  Private key:        {}\n  Certificate:        {}\n  Issuer certificate: {}",
        issued.domain,
        issued.key_path.display(),
        issued.cert_path.display(),
        issued.issuer_cert_path.display()
    )
}

pub fn print_certificate_issued(issued: &CertificateIssued) {
    println!("{}", format_certificate_issued(issued).green());
}
