/// Phone normalization and subject directory matching for shared contacts
///
/// A shared phone is reduced to digits and expanded into the country-code variants it
/// may have been stored under. A directory record matches by phone first, then by the
/// platform user id of the sender.

use crate::error::EngineResult;
use crate::runtime::events::ContactInfo;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};

/// Digits of `raw`, everything else dropped
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Every spelling a stored phone might use for the same number
///
/// 10 digits gain a leading `1`; 11 digits starting with `1` also lose it; 11 digits
/// starting with `8` or `7` swap that prefix. Each variant is listed with and without
/// a leading `+`.
pub fn phone_variants(raw: &str) -> Vec<String> {
    let digits = normalize_phone(raw);
    if digits.is_empty() {
        return Vec::new();
    }

    let mut bases = vec![digits.clone()];
    match (digits.len(), digits.as_bytes()[0]) {
        (10, _) => bases.push(format!("1{}", digits)),
        (11, b'1') => bases.push(digits[1..].to_string()),
        (11, b'8') => bases.push(format!("7{}", &digits[1..])),
        (11, b'7') => bases.push(format!("8{}", &digits[1..])),
        _ => {}
    }

    let mut variants = Vec::with_capacity(bases.len() * 2);
    for base in bases {
        for candidate in [base.clone(), format!("+{}", base)] {
            if !variants.contains(&candidate) {
                variants.push(candidate);
            }
        }
    }
    variants
}

/// How a shared contact was matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Phone,
    PlatformId,
}

/// Outcome stored under the contact-match variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContactMatch {
    Matched { subject_id: String, matched_by: MatchedBy },
    Unmatched { phone: String },
}

impl ContactMatch {
    pub fn subject_id(&self) -> Option<&str> {
        match self {
            ContactMatch::Matched { subject_id, .. } => Some(subject_id),
            ContactMatch::Unmatched { .. } => None,
        }
    }
}

/// Subject record in the directory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectRecord {
    pub id: String,
    pub platform_user_id: Option<String>,
    pub phone: Option<String>,
    pub display_name: Option<String>,
}

/// Directory of known subjects (customers, members, ...)
#[derive(Debug, Clone)]
pub struct SubjectDirectory {
    pool: SqlitePool,
}

impl SubjectDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add a record; returns its id
    pub async fn register(
        &self,
        display_name: Option<&str>,
        phone: Option<&str>,
        platform_user_id: Option<&str>,
    ) -> EngineResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO subjects (id, platform_user_id, phone, display_name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(platform_user_id)
        .bind(phone.map(|p| format!("+{}", normalize_phone(p))))
        .bind(display_name)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> EngineResult<Option<SubjectRecord>> {
        let row = sqlx::query("SELECT id, platform_user_id, phone, display_name FROM subjects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| SubjectRecord {
            id: row.get("id"),
            platform_user_id: row.get("platform_user_id"),
            phone: row.get("phone"),
            display_name: row.get("display_name"),
        }))
    }

    /// Match a shared contact against the directory and merge identities
    ///
    /// A phone match links the sender's platform id to the record when it has none.
    /// A platform id match stores the freshly shared phone on the record. No record
    /// is created when nothing matches.
    pub async fn match_contact(&self, contact: &ContactInfo, sender_user_id: &str) -> EngineResult<ContactMatch> {
        let platform_id = contact.user_id.as_deref().unwrap_or(sender_user_id);
        let variants = phone_variants(&contact.phone_number);
        let normalized = format!("+{}", normalize_phone(&contact.phone_number));

        if !variants.is_empty() {
            let placeholders = vec!["?"; variants.len()].join(", ");
            let sql = format!(
                "SELECT id, platform_user_id FROM subjects WHERE phone IN ({}) ORDER BY created_at ASC LIMIT 1",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for variant in &variants {
                query = query.bind(variant);
            }

            if let Some(row) = query.fetch_optional(&self.pool).await? {
                let subject_id: String = row.get("id");
                let linked: Option<String> = row.get("platform_user_id");
                if linked.is_none() {
                    self.link_platform_id(&subject_id, platform_id).await?;
                }
                tracing::info!("📇 Contact matched subject {} by phone", subject_id);
                return Ok(ContactMatch::Matched { subject_id, matched_by: MatchedBy::Phone });
            }
        }

        let row = sqlx::query("SELECT id FROM subjects WHERE platform_user_id = ?")
            .bind(platform_id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            let subject_id: String = row.get("id");
            if !variants.is_empty() {
                sqlx::query("UPDATE subjects SET phone = ?, updated_at = ? WHERE id = ?")
                    .bind(&normalized)
                    .bind(Utc::now().to_rfc3339())
                    .bind(&subject_id)
                    .execute(&self.pool)
                    .await?;
            }
            tracing::info!("📇 Contact matched subject {} by platform id", subject_id);
            return Ok(ContactMatch::Matched { subject_id, matched_by: MatchedBy::PlatformId });
        }

        tracing::debug!("📇 No subject matches contact {}", normalized);
        Ok(ContactMatch::Unmatched { phone: normalized })
    }

    async fn link_platform_id(&self, subject_id: &str, platform_id: &str) -> EngineResult<()> {
        let result = sqlx::query("UPDATE subjects SET platform_user_id = ?, updated_at = ? WHERE id = ?")
            .bind(platform_id)
            .bind(Utc::now().to_rfc3339())
            .bind(subject_id)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            // Platform id already belongs to another record; keep both records as they are
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tracing::warn!("⚠️ Platform id {} already linked to another subject", platform_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
