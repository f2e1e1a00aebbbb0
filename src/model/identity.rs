use std::fmt::{self, Display, Formatter};

use serde::Serialize;

use crate::error::{Error, Result};

/// Longest serial number accepted in an institutional email or matric number.
const MAX_SERIAL_DIGITS: usize = 5;

/// The credential field that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityField {
    InstitutionalEmail,
    PersonalEmail,
    MatricNumber,
    FullName,
}

impl Display for IdentityField {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InstitutionalEmail => "institutional email",
            Self::PersonalEmail => "personal email",
            Self::MatricNumber => "matric number",
            Self::FullName => "full name",
        };
        f.write_str(name)
    }
}

/// Admission year, department, and serial encoded in a student's credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub year: String,
    pub department: String,
    pub serial: String,
}

/// A normalized, cross-validated student identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub institutional_email: String,
    pub personal_email: String,
    pub matric_number: String,
    pub full_name: String,
    pub enrollment: Enrollment,
}

/// Checks sign-in credentials against the institution's encoding rules.
#[derive(Debug, Clone)]
pub struct IdentityValidator {
    domain: String,
    years: Vec<String>,
    /// Lower case, longest first so that prefix matching is greedy.
    departments: Vec<String>,
}

impl IdentityValidator {
    pub fn new(
        domain: impl Into<String>,
        years: impl IntoIterator<Item = impl Into<String>>,
        departments: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut departments = departments
            .into_iter()
            .map(|d| d.into().to_lowercase())
            .collect::<Vec<_>>();
        departments.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self {
            domain: domain.into().to_lowercase(),
            years: years.into_iter().map(Into::into).collect(),
            departments,
        }
    }

    /// Validate all four credential fields and return the normalized identity.
    /// Nothing is written anywhere; a failure names the first offending field.
    pub fn validate(
        &self,
        institutional_email: &str,
        personal_email: &str,
        matric_number: &str,
        full_name: &str,
    ) -> Result<Identity> {
        let (institutional_email, enrollment) = self.parse_institutional_email(institutional_email)?;
        let personal_email = parse_personal_email(personal_email, &institutional_email)?;
        let full_name = parse_full_name(full_name)?;
        let (matric_number, matric) = self.parse_matric_number(matric_number)?;

        if matric.year != enrollment.year {
            return Err(Error::validation(
                IdentityField::MatricNumber,
                format!(
                    "admission year {} does not match institutional email year {}",
                    matric.year, enrollment.year
                ),
            ));
        }
        if matric.department != enrollment.department {
            return Err(Error::validation(
                IdentityField::MatricNumber,
                format!(
                    "department {} does not match institutional email department {}",
                    matric.department, enrollment.department
                ),
            ));
        }

        Ok(Identity {
            institutional_email,
            personal_email,
            matric_number,
            full_name,
            enrollment,
        })
    }

    /// `<year><dept-code><serial>@<domain>`, e.g. `2203sen001@inst.edu`.
    fn parse_institutional_email(&self, email: &str) -> Result<(String, Enrollment)> {
        const FIELD: IdentityField = IdentityField::InstitutionalEmail;
        let email = email.trim().to_lowercase();
        let (local, domain) = email
            .split_once('@')
            .ok_or_else(|| Error::validation(FIELD, "missing '@'"))?;
        if domain != self.domain {
            return Err(Error::validation(
                FIELD,
                format!("must be an @{} address", self.domain),
            ));
        }
        if local.len() < 2 || !local.is_char_boundary(2) {
            return Err(Error::validation(FIELD, "too short"));
        }
        let (year, rest) = local.split_at(2);
        let enrollment = self.parse_enrollment(FIELD, year, rest)?;
        Ok((email, enrollment))
    }

    /// `<year>/<dept-code><serial>`, e.g. `22/03sen001`.
    fn parse_matric_number(&self, matric: &str) -> Result<(String, Enrollment)> {
        const FIELD: IdentityField = IdentityField::MatricNumber;
        let matric = matric.trim().to_lowercase();
        let (year, rest) = matric
            .split_once('/')
            .ok_or_else(|| Error::validation(FIELD, "expected <year>/<department><serial>"))?;
        let enrollment = self.parse_enrollment(FIELD, year, rest)?;
        Ok((matric, enrollment))
    }

    fn parse_enrollment(&self, field: IdentityField, year: &str, rest: &str) -> Result<Enrollment> {
        if year.len() != 2 || !year.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::validation(field, "admission year must be two digits"));
        }
        if !self.years.iter().any(|y| y == year) {
            return Err(Error::validation(
                field,
                format!("admission year {year} is not eligible"),
            ));
        }
        let department = self
            .departments
            .iter()
            .find(|d| rest.starts_with(d.as_str()))
            .ok_or_else(|| Error::validation(field, "unknown department code"))?;
        let serial = &rest[department.len()..];
        if serial.is_empty()
            || serial.len() > MAX_SERIAL_DIGITS
            || !serial.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(Error::validation(
                field,
                format!("serial must be 1 to {MAX_SERIAL_DIGITS} digits"),
            ));
        }
        Ok(Enrollment {
            year: year.to_string(),
            department: department.clone(),
            serial: serial.to_string(),
        })
    }
}

fn parse_personal_email(email: &str, institutional_email: &str) -> Result<String> {
    const FIELD: IdentityField = IdentityField::PersonalEmail;
    let email = email.trim().to_lowercase();
    if !is_valid_address(&email) {
        return Err(Error::validation(FIELD, "not a valid email address"));
    }
    if email == institutional_email {
        return Err(Error::validation(
            FIELD,
            "must differ from the institutional email",
        ));
    }
    Ok(email)
}

/// Syntactic check only: `local@domain.tld`, one `@`, no whitespace or empty labels.
fn is_valid_address(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let allowed_local = |c: char| c.is_ascii_alphanumeric() || "!#$%&'*+-/=?^_`{|}~.".contains(c);
    let allowed_domain = |c: char| c.is_ascii_alphanumeric() || c == '-';
    !local.is_empty()
        && local.len() <= 64
        && local.chars().all(allowed_local)
        && !local.starts_with('.')
        && !local.ends_with('.')
        && domain.contains('.')
        && domain
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(allowed_domain))
}

fn parse_full_name(name: &str) -> Result<String> {
    let tokens = name.split_whitespace().collect::<Vec<_>>();
    if tokens.len() < 2 {
        return Err(Error::validation(
            IdentityField::FullName,
            "enter at least a first name and a surname",
        ));
    }
    if let Some(short) = tokens.iter().find(|t| t.chars().count() < 2) {
        return Err(Error::validation(
            IdentityField::FullName,
            format!("name part '{short}' is too short"),
        ));
    }
    Ok(tokens.join(" "))
}
