//! Header auto-mapping: a static alias table from normalized header to canonical field.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use leadflow_core::{CustomFields, FieldMapping};

use crate::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalField {
    Email,
    FirstName,
    LastName,
    FullName,
    Title,
    Phone,
    City,
    State,
    PostalCode,
    Country,
    LinkedinUrl,
    CavId,
    CavUserId,
    Topics,
    CompanyName,
    CompanyDomain,
    CompanyPhone,
    Industry,
    HqStreet,
    HqCity,
    HqState,
    HqPostalCode,
    HqCountry,
    Tags,
    TechStack,
    SourceRecordId,
    SourceUpdatedAt,
    ValidationStatus,
    SubmittedAt,
    SubmissionRef,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 30] = [
        CanonicalField::Email,
        CanonicalField::FirstName,
        CanonicalField::LastName,
        CanonicalField::FullName,
        CanonicalField::Title,
        CanonicalField::Phone,
        CanonicalField::City,
        CanonicalField::State,
        CanonicalField::PostalCode,
        CanonicalField::Country,
        CanonicalField::LinkedinUrl,
        CanonicalField::CavId,
        CanonicalField::CavUserId,
        CanonicalField::Topics,
        CanonicalField::CompanyName,
        CanonicalField::CompanyDomain,
        CanonicalField::CompanyPhone,
        CanonicalField::Industry,
        CanonicalField::HqStreet,
        CanonicalField::HqCity,
        CanonicalField::HqState,
        CanonicalField::HqPostalCode,
        CanonicalField::HqCountry,
        CanonicalField::Tags,
        CanonicalField::TechStack,
        CanonicalField::SourceRecordId,
        CanonicalField::SourceUpdatedAt,
        CanonicalField::ValidationStatus,
        CanonicalField::SubmittedAt,
        CanonicalField::SubmissionRef,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::Email => "email",
            CanonicalField::FirstName => "first_name",
            CanonicalField::LastName => "last_name",
            CanonicalField::FullName => "full_name",
            CanonicalField::Title => "title",
            CanonicalField::Phone => "phone",
            CanonicalField::City => "city",
            CanonicalField::State => "state",
            CanonicalField::PostalCode => "postal_code",
            CanonicalField::Country => "country",
            CanonicalField::LinkedinUrl => "linkedin_url",
            CanonicalField::CavId => "cav_id",
            CanonicalField::CavUserId => "cav_user_id",
            CanonicalField::Topics => "topics",
            CanonicalField::CompanyName => "company_name",
            CanonicalField::CompanyDomain => "company_domain",
            CanonicalField::CompanyPhone => "company_phone",
            CanonicalField::Industry => "industry",
            CanonicalField::HqStreet => "hq_street",
            CanonicalField::HqCity => "hq_city",
            CanonicalField::HqState => "hq_state",
            CanonicalField::HqPostalCode => "hq_postal_code",
            CanonicalField::HqCountry => "hq_country",
            CanonicalField::Tags => "tags",
            CanonicalField::TechStack => "tech_stack",
            CanonicalField::SourceRecordId => "source_record_id",
            CanonicalField::SourceUpdatedAt => "source_updated_at",
            CanonicalField::ValidationStatus => "validation_status",
            CanonicalField::SubmittedAt => "submitted_at",
            CanonicalField::SubmissionRef => "submission_ref",
        }
    }
}

impl FromStr for CanonicalField {
    type Err = AdapterError;

    /// Accepts the canonical name or any header alias.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(field) = CanonicalField::ALL.into_iter().find(|f| f.as_str() == s.trim()) {
            return Ok(field);
        }
        lookup_alias(s).ok_or_else(|| AdapterError::UnknownTarget(s.to_string()))
    }
}

use CanonicalField as F;

/// Recognized header spellings, already in normalized form (see [`normalize_header`]).
const HEADER_ALIASES: &[(&str, CanonicalField)] = &[
    ("email", F::Email),
    ("emailaddress", F::Email),
    ("workemail", F::Email),
    ("businessemail", F::Email),
    ("contactemail", F::Email),
    ("firstname", F::FirstName),
    ("first", F::FirstName),
    ("givenname", F::FirstName),
    ("fname", F::FirstName),
    ("lastname", F::LastName),
    ("last", F::LastName),
    ("surname", F::LastName),
    ("familyname", F::LastName),
    ("lname", F::LastName),
    ("fullname", F::FullName),
    ("name", F::FullName),
    ("contactname", F::FullName),
    ("title", F::Title),
    ("jobtitle", F::Title),
    ("position", F::Title),
    ("phone", F::Phone),
    ("phonenumber", F::Phone),
    ("directphone", F::Phone),
    ("mobile", F::Phone),
    ("mobilephone", F::Phone),
    ("city", F::City),
    ("state", F::State),
    ("province", F::State),
    ("stateprovince", F::State),
    ("postalcode", F::PostalCode),
    ("zip", F::PostalCode),
    ("zipcode", F::PostalCode),
    ("postcode", F::PostalCode),
    ("country", F::Country),
    ("contactcountry", F::Country),
    ("linkedin", F::LinkedinUrl),
    ("linkedinurl", F::LinkedinUrl),
    ("cavid", F::CavId),
    ("cavuserid", F::CavUserId),
    ("topics", F::Topics),
    ("interests", F::Topics),
    ("company", F::CompanyName),
    ("companyname", F::CompanyName),
    ("accountname", F::CompanyName),
    ("organization", F::CompanyName),
    ("organisation", F::CompanyName),
    ("employer", F::CompanyName),
    ("domain", F::CompanyDomain),
    ("companydomain", F::CompanyDomain),
    ("website", F::CompanyDomain),
    ("companywebsite", F::CompanyDomain),
    ("websiteurl", F::CompanyDomain),
    ("companyphone", F::CompanyPhone),
    ("hqphone", F::CompanyPhone),
    ("industry", F::Industry),
    ("sector", F::Industry),
    ("hqstreet", F::HqStreet),
    ("hqaddress", F::HqStreet),
    ("companyaddress", F::HqStreet),
    ("hqcity", F::HqCity),
    ("companycity", F::HqCity),
    ("hqstate", F::HqState),
    ("companystate", F::HqState),
    ("hqpostalcode", F::HqPostalCode),
    ("hqzip", F::HqPostalCode),
    ("hqcountry", F::HqCountry),
    ("companycountry", F::HqCountry),
    ("tags", F::Tags),
    ("accounttags", F::Tags),
    ("techstack", F::TechStack),
    ("technologies", F::TechStack),
    ("sourcerecordid", F::SourceRecordId),
    ("recordid", F::SourceRecordId),
    ("externalid", F::SourceRecordId),
    ("sourceupdatedat", F::SourceUpdatedAt),
    ("lastmodified", F::SourceUpdatedAt),
    ("status", F::ValidationStatus),
    ("validationstatus", F::ValidationStatus),
    ("emailstatus", F::ValidationStatus),
    ("verificationresult", F::ValidationStatus),
    ("submittedat", F::SubmittedAt),
    ("submissiondate", F::SubmittedAt),
    ("deliveredat", F::SubmittedAt),
    ("submissionref", F::SubmissionRef),
    ("submissionid", F::SubmissionRef),
    ("leadid", F::SubmissionRef),
];

/// Lower-cased ASCII alphanumerics only: `"Company Name"`, `"company_name"` and `"companyname"` agree.
pub fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub fn lookup_alias(header: &str) -> Option<CanonicalField> {
    let key = normalize_header(header);
    HEADER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, field)| *field)
}

/// Checks the alias table is well-formed: every entry already normalized and none repeated.
pub fn validate_alias_table() -> Result<(), AdapterError> {
    let mut seen = HashSet::new();
    for (alias, _) in HEADER_ALIASES {
        if normalize_header(alias) != *alias || !seen.insert(*alias) {
            return Err(AdapterError::DuplicateAlias(alias.to_string()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnTarget {
    Field(CanonicalField),
    Custom(String),
    Skip,
}

impl ColumnTarget {
    /// Parses a caller-supplied mapping target: a canonical field, `custom.<key>`, or `skip`.
    pub fn parse(target: &str) -> Result<Self, AdapterError> {
        let trimmed = target.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("skip") || trimmed.eq_ignore_ascii_case("ignore") {
            return Ok(ColumnTarget::Skip);
        }
        let custom_key = trimmed
            .strip_prefix("custom.")
            .or_else(|| trimmed.strip_prefix("custom:"));
        if let Some(key) = custom_key {
            let key = key.trim();
            if key.is_empty() {
                return Err(AdapterError::UnknownTarget(target.to_string()));
            }
            return Ok(ColumnTarget::Custom(key.to_string()));
        }
        trimmed.parse().map(ColumnTarget::Field)
    }
}

/// Column index to target, resolved once per job from the header and any overrides.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    targets: Vec<ColumnTarget>,
}

impl ColumnMap {
    pub fn build(headers: &[String], overrides: &[FieldMapping]) -> Result<Self, AdapterError> {
        let mut explicit: HashMap<String, ColumnTarget> = HashMap::new();
        for mapping in overrides {
            explicit.insert(
                normalize_header(&mapping.csv_column),
                ColumnTarget::parse(&mapping.target_field)?,
            );
        }
        let targets = headers
            .iter()
            .map(|header| {
                let key = normalize_header(header);
                explicit
                    .get(&key)
                    .cloned()
                    .or_else(|| lookup_alias(header).map(ColumnTarget::Field))
                    .unwrap_or(ColumnTarget::Skip)
            })
            .collect();
        Ok(Self { targets })
    }

    pub fn has(&self, field: CanonicalField) -> bool {
        self.targets.contains(&ColumnTarget::Field(field))
    }

    pub fn targets(&self) -> &[ColumnTarget] {
        &self.targets
    }

    /// Projects one record; for a field mapped by several columns the first non-empty cell wins.
    pub fn apply(&self, row: u64, record: &[String]) -> MappedRow {
        let mut fields = HashMap::new();
        let mut custom = CustomFields::new();
        let mut any_value = false;
        for (target, cell) in self.targets.iter().zip(record) {
            let value = cell.trim();
            if value.is_empty() {
                continue;
            }
            any_value = true;
            match target {
                ColumnTarget::Field(field) => {
                    fields.entry(*field).or_insert_with(|| value.to_string());
                }
                ColumnTarget::Custom(key) => custom.insert(key.clone(), value),
                ColumnTarget::Skip => {}
            }
        }
        MappedRow {
            row,
            fields,
            custom,
            blank: !any_value,
        }
    }
}

/// One data row keyed by canonical field. `row` is the 1-based data-row number.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRow {
    pub row: u64,
    fields: HashMap<CanonicalField, String>,
    pub custom: CustomFields,
    blank: bool,
}

impl MappedRow {
    pub fn get(&self, field: CanonicalField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    pub fn owned(&self, field: CanonicalField) -> Option<String> {
        self.get(field).map(str::to_string)
    }

    pub fn is_blank(&self) -> bool {
        self.blank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn alias_table_is_valid() {
        validate_alias_table().expect("alias table");
        assert!(HEADER_ALIASES.len() >= 60);
    }

    #[test]
    fn company_spellings_share_one_field() {
        for header in ["Company", "companyName", "Account_Name", "company name"] {
            assert_eq!(lookup_alias(header), Some(CanonicalField::CompanyName), "{header}");
        }
        assert_eq!(lookup_alias("favourite colour"), None);
    }

    #[test]
    fn overrides_win_over_aliases_and_unknown_headers_are_skipped() {
        let map = ColumnMap::build(
            &headers(&["E-mail", "Org", "Segment", "Notes"]),
            &[
                FieldMapping {
                    csv_column: "org".into(),
                    target_field: "company_name".into(),
                },
                FieldMapping {
                    csv_column: "Segment".into(),
                    target_field: "custom.segment".into(),
                },
            ],
        )
        .expect("map");
        assert_eq!(
            map.targets(),
            &[
                ColumnTarget::Field(CanonicalField::Email),
                ColumnTarget::Field(CanonicalField::CompanyName),
                ColumnTarget::Custom("segment".into()),
                ColumnTarget::Skip,
            ]
        );
    }

    #[test]
    fn override_targets_accept_aliases_and_custom_colon_form() {
        assert_eq!(
            ColumnTarget::parse("Job Title").expect("alias"),
            ColumnTarget::Field(CanonicalField::Title)
        );
        assert_eq!(
            ColumnTarget::parse("custom:tier").expect("custom"),
            ColumnTarget::Custom("tier".into())
        );
        assert_eq!(ColumnTarget::parse("skip").expect("skip"), ColumnTarget::Skip);
        assert!(matches!(
            ColumnTarget::parse("shoe_size"),
            Err(AdapterError::UnknownTarget(_))
        ));
        assert!(ColumnTarget::parse("custom.").is_err());
    }

    #[test]
    fn first_non_empty_cell_wins_for_repeated_fields() {
        let map = ColumnMap::build(&headers(&["email", "work email", "x_tier"]), &[
            FieldMapping {
                csv_column: "x_tier".into(),
                target_field: "custom.tier".into(),
            },
        ])
        .expect("map");
        let row = map.apply(3, &headers(&["", "a@acme.com", "gold"]));
        assert_eq!(row.row, 3);
        assert_eq!(row.get(CanonicalField::Email), Some("a@acme.com"));
        assert_eq!(row.custom.get("tier"), Some("gold"));
        assert!(!row.is_blank());
        assert!(map.apply(4, &headers(&["", " ", ""])).is_blank());
    }
}
