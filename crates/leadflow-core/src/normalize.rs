//! Canonical keys for matching: emails, domains, names, phones, countries.
//!
//! Every function here is total and idempotent: garbage input yields `None`
//! (or a [`DomainRejection`]), never a panic, and feeding an output back in
//! returns the same output.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Free mailbox providers; a contact at one of these tells us nothing about their company.
const PERSONAL_MAILBOX_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "yahoo.co.uk",
    "ymail.com",
    "hotmail.com",
    "hotmail.co.uk",
    "outlook.com",
    "live.com",
    "msn.com",
    "aol.com",
    "icloud.com",
    "me.com",
    "mac.com",
    "protonmail.com",
    "proton.me",
    "gmx.com",
    "gmx.net",
    "mail.com",
    "yandex.com",
    "zoho.com",
    "comcast.net",
];

const PLACEHOLDER_DOMAINS: &[&str] = &[
    "example.com",
    "example.org",
    "example.net",
    "test.com",
    "domain.com",
    "email.com",
    "localhost",
];

/// Second-level suffixes under which the registrable domain has three labels.
const MULTI_PART_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "ltd.uk", "plc.uk", "me.uk", "com.au", "net.au",
    "org.au", "co.nz", "co.jp", "co.in", "co.za", "co.kr", "com.br", "com.mx", "com.sg",
    "com.cn", "com.hk", "com.tr", "com.ar",
];

/// Trailing tokens dropped from company names when building comparison keys.
const LEGAL_SUFFIXES: &[&str] = &[
    "inc",
    "incorporated",
    "ltd",
    "limited",
    "llc",
    "llp",
    "lp",
    "corp",
    "corporation",
    "co",
    "company",
    "plc",
    "gmbh",
    "ag",
    "sa",
    "sarl",
    "srl",
    "bv",
    "nv",
    "pty",
    "pvt",
    "oy",
    "ab",
    "kk",
];

const COUNTRY_ALIASES: &[(&str, &str)] = &[
    ("us", "united states"),
    ("usa", "united states"),
    ("u s", "united states"),
    ("u s a", "united states"),
    ("united states of america", "united states"),
    ("america", "united states"),
    ("uk", "united kingdom"),
    ("u k", "united kingdom"),
    ("gb", "united kingdom"),
    ("great britain", "united kingdom"),
    ("britain", "united kingdom"),
    ("england", "united kingdom"),
    ("uae", "united arab emirates"),
    ("deutschland", "germany"),
    ("holland", "netherlands"),
    ("the netherlands", "netherlands"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainRejection {
    #[error("empty domain")]
    Empty,
    #[error("domain contains whitespace")]
    EmbeddedWhitespace,
    #[error("domain contains consecutive dots")]
    DoubleDot,
    #[error("malformed domain label '{0}'")]
    MalformedLabel(String),
    #[error("malformed top-level domain in '{0}'")]
    MalformedTld(String),
    #[error("personal mailbox domain '{0}'")]
    PersonalMailbox(String),
    #[error("placeholder domain '{0}'")]
    Placeholder(String),
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn normalize_email(input: &str) -> Option<String> {
    let email = input.trim().to_lowercase();
    if email.is_empty() {
        None
    } else {
        Some(email)
    }
}

/// Registrable company domain behind an email address, if it is a business domain.
pub fn email_domain(email: &str) -> Option<String> {
    let email = normalize_email(email)?;
    let (_, host) = email.rsplit_once('@')?;
    normalize_domain(host)
}

pub fn normalize_domain(input: &str) -> Option<String> {
    classify_domain(input).ok()
}

/// Reduces a URL, host, or email to its registrable root domain, or explains why not.
pub fn classify_domain(input: &str) -> Result<String, DomainRejection> {
    let mut host = input.trim().to_lowercase();
    if host.is_empty() {
        return Err(DomainRejection::Empty);
    }
    if let Some(idx) = host.find("://") {
        host = host[idx + 3..].to_string();
    }
    if let Some(end) = host.find(['/', '?', '#']) {
        host.truncate(end);
    }
    if let Some(idx) = host.rfind('@') {
        host = host[idx + 1..].to_string();
    }
    if let Some(idx) = host.rfind(':') {
        host.truncate(idx);
    }
    let host = host.trim_end_matches('.');
    if host.is_empty() {
        return Err(DomainRejection::Empty);
    }
    if host.chars().any(char::is_whitespace) {
        return Err(DomainRejection::EmbeddedWhitespace);
    }
    if host.contains("..") {
        return Err(DomainRejection::DoubleDot);
    }
    let host = host.strip_prefix("www.").unwrap_or(host);
    if PLACEHOLDER_DOMAINS.contains(&host) {
        return Err(DomainRejection::Placeholder(host.to_string()));
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return Err(DomainRejection::MalformedTld(host.to_string()));
    }
    for label in &labels {
        let valid = !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return Err(DomainRejection::MalformedLabel(label.to_string()));
        }
    }
    let tld = labels[labels.len() - 1];
    let tld_ok = tld.starts_with("xn--")
        || ((2..=24).contains(&tld.len()) && tld.chars().all(|c| c.is_ascii_alphabetic()));
    if !tld_ok {
        return Err(DomainRejection::MalformedTld(host.to_string()));
    }

    let suffix = labels[labels.len() - 2..].join(".");
    let root = if MULTI_PART_SUFFIXES.contains(&suffix.as_str()) {
        if labels.len() < 3 {
            return Err(DomainRejection::MalformedTld(host.to_string()));
        }
        labels[labels.len() - 3..].join(".")
    } else {
        suffix
    };

    if PERSONAL_MAILBOX_DOMAINS.contains(&root.as_str()) {
        return Err(DomainRejection::PersonalMailbox(root));
    }
    if PLACEHOLDER_DOMAINS.contains(&root.as_str()) {
        return Err(DomainRejection::Placeholder(root));
    }
    Ok(root)
}

/// The label left of the public suffix: `acme` for `acme.co.uk`.
pub fn domain_stem(domain: &str) -> &str {
    domain.split('.').next().unwrap_or(domain)
}

/// Lower-cases, strips control characters, and collapses internal whitespace.
pub fn normalize_name(input: &str) -> Option<String> {
    let cleaned: String = input
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .to_lowercase();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Comparison key for company names: punctuation folded, legal suffixes dropped.
///
/// Only for matching. Stored names keep their original form.
pub fn normalize_company_key(input: &str) -> Option<String> {
    let name = normalize_name(input)?;
    let folded: String = name
        .chars()
        .map(|c| match c {
            '&' => ' ',
            c if c.is_alphanumeric() => c,
            _ => ' ',
        })
        .collect();
    let mut tokens: Vec<&str> = folded.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }
    while tokens.len() > 1 {
        match tokens.last() {
            Some(last) if LEGAL_SUFFIXES.contains(last) => {
                tokens.pop();
            }
            _ => break,
        }
    }
    Some(tokens.join(" "))
}

/// First token of a company key worth filtering candidates on.
pub fn first_significant_word(company_key: &str) -> Option<&str> {
    company_key
        .split_whitespace()
        .find(|w| w.chars().count() >= 2 && !matches!(*w, "the" | "a" | "an"))
}

/// E.164 form of a phone number, or `None` when it cannot be interpreted.
///
/// Ten-digit numbers without a country code are read as North American.
/// Extensions (`x123`, `ext. 9`, `#4`) are dropped.
pub fn normalize_phone_e164(input: &str) -> Option<String> {
    let main: String = input
        .trim()
        .chars()
        .take_while(|c| !c.is_alphabetic() && *c != '#')
        .collect();
    let main = main.trim();
    if main.is_empty() {
        return None;
    }
    if !main
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')' | '.' | '/'))
    {
        return None;
    }

    let has_plus = main.starts_with('+');
    let digits: String = main.chars().filter(|c| c.is_ascii_digit()).collect();
    let international = if has_plus {
        digits
    } else if let Some(rest) = digits.strip_prefix("00") {
        rest.to_string()
    } else if digits.len() == 10 && !digits.starts_with(['0', '1']) {
        format!("1{digits}")
    } else if digits.len() == 11 && digits.starts_with('1') {
        digits
    } else {
        return None;
    };

    if !(8..=15).contains(&international.len()) || international.starts_with('0') {
        return None;
    }
    Some(format!("+{international}"))
}

/// Deterministic hex digest of `name|company`, present only when both parts are non-empty.
///
/// The `|` separator keeps "John Smith"/"Acme" distinct from "John"/"Smith Acme";
/// a literal `|` inside either part is folded to a space first.
pub fn compute_name_company_hash(name: &str, company: &str) -> Option<String> {
    let name = normalize_name(&name.replace('|', " "))?;
    let company = normalize_name(&company.replace('|', " "))?;
    Some(sha256_hex(format!("{name}|{company}").as_bytes()))
}

pub fn normalize_external_id(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_country(input: &str) -> Option<String> {
    let name = normalize_name(&input.replace('.', " "))?;
    let canonical = COUNTRY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| canonical.to_string());
    Some(canonical.unwrap_or(name))
}

/// Set-semantics normalization for tag-like lists: trimmed, lower-cased, deduplicated, sorted.
pub fn normalize_tags<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = values
        .into_iter()
        .filter_map(normalize_name)
        .collect();
    out.sort();
    out.dedup();
    out
}
