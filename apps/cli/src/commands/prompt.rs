//! Terminal responder for capability approval requests.

use colored::{ColoredString, Colorize};
use inquire::Confirm;
use tibok_core::plugins::{ApprovalInbox, ApprovalRequest, RiskLevel};
use tokio::task::JoinHandle;

/// Answers approval requests until the inbox closes.
///
/// With `auto_approve` every request is acknowledged and approved; otherwise
/// the user is asked on the terminal. Without a terminal the request is
/// denied.
pub fn spawn_responder(mut inbox: ApprovalInbox, auto_approve: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = inbox.next().await {
            present(&request);
            if auto_approve {
                println!("{}", "Approved with --yes.".bright_black());
                approve(request);
                continue;
            }

            let needs_ack = request.requires_acknowledgment();
            let answer = tokio::task::spawn_blocking(move || ask(needs_ack)).await;
            match answer {
                Ok(Answer::Approve) => approve(request),
                Ok(Answer::Deny) => {
                    println!("{}", "Denied.".yellow());
                    request.deny();
                }
                Ok(Answer::NoTerminal) | Err(_) => {
                    println!("{}", "No terminal to ask on; pass --yes to approve.".yellow());
                    request.deny();
                }
            }
        }
    })
}

enum Answer {
    Approve,
    Deny,
    NoTerminal,
}

fn ask(needs_ack: bool) -> Answer {
    if needs_ack {
        match Confirm::new("This community plugin is unreviewed. Do you understand the risk?")
            .with_default(false)
            .prompt()
        {
            Ok(true) => {}
            Ok(false) => return Answer::Deny,
            Err(_) => return Answer::NoTerminal,
        }
    }

    match Confirm::new("Grant these capabilities?").with_default(false).prompt() {
        Ok(true) => Answer::Approve,
        Ok(false) => Answer::Deny,
        Err(_) => Answer::NoTerminal,
    }
}

fn approve(mut request: ApprovalRequest) {
    if request.requires_acknowledgment() {
        request.acknowledge();
    }
    if let Err(request) = request.approve() {
        request.deny();
    }
}

fn present(request: &ApprovalRequest) {
    let manifest = request.manifest();
    println!();
    println!(
        "{} {} {} ({})",
        "Permission request:".bold(),
        manifest.name.cyan(),
        manifest.version.bright_black(),
        request.tier()
    );
    for capability in request.capabilities() {
        println!("  • {} [{}]", capability.display_name(), risk_label(capability.risk()));
        println!("    {}", capability.description().bright_black());
    }
    if request.requires_acknowledgment() {
        println!("{}", "⚠ This plugin has not been reviewed and requests sensitive access.".yellow());
    }
}

/// Risk level colored by severity.
pub fn risk_label(risk: RiskLevel) -> ColoredString {
    match risk {
        RiskLevel::Safe => risk.to_string().green(),
        RiskLevel::Moderate => risk.to_string().yellow(),
        RiskLevel::High => risk.to_string().red(),
    }
}
