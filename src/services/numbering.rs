//! Document numbering backed by the `document_sequences` table.

use sea_orm::{ActiveModelTrait, ActiveValue::Set, ConnectionTrait, EntityTrait};

use crate::{
    db::lock_for_update,
    entities::document_sequence::{self, Entity as DocumentSequenceEntity},
    errors::ServiceError,
};

/// Numbered document types, each with its own sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DocumentType {
    Order,
    Invoice,
    CreditNote,
}

/// Takes the next value of a sequence. Must run inside the transaction that
/// inserts the document, so a rollback returns the number.
pub(crate) async fn next_value<C>(conn: &C, doc_type: DocumentType) -> Result<i64, ServiceError>
where
    C: ConnectionTrait,
{
    let key = doc_type.as_ref();
    let row = lock_for_update(DocumentSequenceEntity::find_by_id(key.to_string()), conn)
        .one(conn)
        .await?;

    match row {
        Some(row) => {
            let value = row.next_value;
            let mut active: document_sequence::ActiveModel = row.into();
            active.next_value = Set(value + 1);
            active.update(conn).await?;
            Ok(value)
        }
        None => {
            document_sequence::ActiveModel {
                doc_type: Set(key.to_string()),
                next_value: Set(2),
            }
            .insert(conn)
            .await?;
            Ok(1)
        }
    }
}

pub fn format_document_number(prefix: &str, value: i64) -> String {
    format!("{}-{}", prefix, value)
}

/// `<order number>-<sequence>` with a three digit sequence.
pub fn delivery_note_number(order_number: &str, sequence: i32) -> String {
    format!("{}-{:03}", order_number, sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_numbers() {
        assert_eq!(format_document_number("RE", 1042), "RE-1042");
        assert_eq!(delivery_note_number("AU-7", 2), "AU-7-002");
        assert_eq!(delivery_note_number("AU-7", 1234), "AU-7-1234");
    }

    #[test]
    fn sequence_keys() {
        assert_eq!(DocumentType::CreditNote.as_ref(), "credit_note");
        assert_eq!(DocumentType::Invoice.as_ref(), "invoice");
    }
}
