// Read-only views of the stored state

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use hostpanel_orchestrator::{Orchestrator, Site};
use hostpanel_provision::CertificateStatus;

use super::{format_report, Outcome};

pub fn handle_status(orchestrator: &Orchestrator, domain: &str, json: bool) -> Result<Outcome> {
    let site = orchestrator.status(domain)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&site)?);
    } else {
        print!("{}", format_site(&site));
    }
    Ok(Outcome::Success)
}

fn format_site(site: &Site) -> String {
    let mut out = String::new();
    out.push_str(&format!("domain:    {}\n", site.domain));
    out.push_str(&format!("type:      {}\n", site.site_type));
    out.push_str(&format!("desired:   {}\n", site.desired));
    out.push_str(&format!("state:     {}\n", site.state));
    out.push_str(&format!("account:   {}\n", site.os_user));
    out.push_str(&format!("root:      {}\n", site.root.display()));
    out.push_str(&format!(
        "pool:      {} (runtime {})\n",
        site.pool_mode, site.runtime_version
    ));
    if let Some(grant) = &site.database {
        out.push_str(&format!(
            "database:  {} {} (user {})\n",
            grant.engine, grant.name, grant.user
        ));
    }
    let certificate = match (site.certificate.status, site.certificate.expires_at) {
        (CertificateStatus::Active, Some(at)) => format!("active until {}", at.format("%Y-%m-%d")),
        (status, _) => format!("{:?}", status).to_lowercase(),
    };
    out.push_str(&format!("tls:       {}\n", certificate));
    if !site.mail_accounts.is_empty() {
        let boxes: Vec<&str> = site.mail_accounts.iter().map(|m| m.local_part.as_str()).collect();
        out.push_str(&format!("mail:      {}\n", boxes.join(", ")));
    }
    if let Some(report) = &site.last_report {
        out.push_str(&format!(
            "last run:  {}\n",
            report.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out.push_str(&format_report(report));
    }
    out
}

pub fn handle_users(orchestrator: &Orchestrator, json: bool) -> Result<Outcome> {
    let references = orchestrator.user_references()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&references)?);
    } else {
        print!("{}", format_users(&references));
    }
    Ok(Outcome::Success)
}

fn format_users(references: &BTreeMap<String, BTreeSet<String>>) -> String {
    if references.is_empty() {
        return "No site accounts\n".to_string();
    }
    references
        .iter()
        .map(|(user, sites)| {
            let sites: Vec<&str> = sites.iter().map(String::as_str).collect();
            format!("{} ({}): {}\n", user, sites.len(), sites.join(", "))
        })
        .collect()
}
