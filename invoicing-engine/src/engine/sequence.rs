//! Document number formatting and overflow guard for the per-business
//! sequencer. The atomic counter itself lives behind
//! `services::sequence::Sequencer`.

use uuid::Uuid;

use crate::engine::error::EngineError;

/// Document kinds that draw from independent per-business counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentType {
    Invoice,
    Payment,
}

impl DocumentType {
    /// Human-readable number prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "INV",
            DocumentType::Payment => "PAY",
        }
    }

    /// Stable key used for the counter row.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "invoice",
            DocumentType::Payment => "payment",
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reject a counter value that wrapped or hit the theoretical bound.
pub fn checked_value(business_id: Uuid, value: i64) -> Result<i64, EngineError> {
    if value <= 0 || value == i64::MAX {
        return Err(EngineError::SequenceExhausted(business_id));
    }
    Ok(value)
}

/// Render a counter value as a prefixed document number, e.g. "INV-01042".
pub fn format_number(doc_type: DocumentType, value: i64) -> String {
    format!("{}-{:05}", doc_type.prefix(), value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_prefix_and_padding() {
        assert_eq!(format_number(DocumentType::Invoice, 42), "INV-00042");
        assert_eq!(format_number(DocumentType::Payment, 1042), "PAY-01042");
        // Padding widens past five digits instead of truncating.
        assert_eq!(format_number(DocumentType::Invoice, 123456), "INV-123456");
    }

    #[test]
    fn overflow_is_sequence_exhausted() {
        let business_id = Uuid::new_v4();
        assert!(checked_value(business_id, 1).is_ok());
        assert!(matches!(
            checked_value(business_id, i64::MAX),
            Err(EngineError::SequenceExhausted(_))
        ));
        assert!(matches!(
            checked_value(business_id, -5),
            Err(EngineError::SequenceExhausted(_))
        ));
    }
}
