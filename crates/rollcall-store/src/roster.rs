//! Enrolled people and their reference signatures.

use crate::{conversion_error, Result, Store, StoreError};
use chrono::{DateTime, Utc};
use rollcall_core::{NewPerson, Person, Signature};
use rusqlite::{params, Connection, OptionalExtension, Row};

const PERSON_COLUMNS: &str = "id, name, roll, parent_name, phone, enrolled_at";

/// Person row without signatures.
fn row_to_person(row: &Row) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        name: row.get(1)?,
        roll: row.get(2)?,
        parent_name: row.get(3)?,
        phone: row.get(4)?,
        signatures: Vec::new(),
        enrolled_at: row.get(5)?,
    })
}

fn load_signatures(conn: &Connection, person_id: &str) -> rusqlite::Result<Vec<Signature>> {
    let mut stmt =
        conn.prepare("SELECT vector FROM signatures WHERE person_id = ?1 ORDER BY position")?;
    let signatures = stmt
        .query_map([person_id], |row| {
            let json: String = row.get(0)?;
            serde_json::from_str::<Signature>(&json).map_err(|e| conversion_error(0, e))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(signatures)
}

fn load_person(conn: &Connection, sql_where: &str, key: &str) -> rusqlite::Result<Option<Person>> {
    let sql = format!("SELECT {PERSON_COLUMNS} FROM persons WHERE {sql_where} = ?1");
    let person = conn.query_row(&sql, [key], row_to_person).optional()?;
    match person {
        Some(mut p) => {
            p.signatures = load_signatures(conn, &p.id)?;
            Ok(Some(p))
        }
        None => Ok(None),
    }
}

fn insert_signatures(
    conn: &Connection,
    person_id: &str,
    first_position: usize,
    encoded: &[String],
) -> rusqlite::Result<()> {
    let mut stmt =
        conn.prepare("INSERT INTO signatures (person_id, position, vector) VALUES (?1, ?2, ?3)")?;
    for (i, vector) in encoded.iter().enumerate() {
        stmt.execute(params![person_id, (first_position + i) as i64, vector])?;
    }
    Ok(())
}

/// Validate and serialize signatures. Non-finite values would be written as
/// JSON `null` and could never be read back.
fn encode(signatures: &[Signature]) -> Result<Vec<String>> {
    if signatures.is_empty() {
        return Err(StoreError::NoSignatures);
    }
    signatures
        .iter()
        .map(|s| -> Result<String> {
            s.check(None)?;
            Ok(serde_json::to_string(s)?)
        })
        .collect()
}

impl Store {
    /// Enroll a person together with their signatures in one transaction.
    pub async fn insert_person(
        &self,
        new: NewPerson,
        signatures: Vec<Signature>,
        enrolled_at: DateTime<Utc>,
    ) -> Result<Person> {
        let encoded = encode(&signatures)?;
        let id = uuid::Uuid::new_v4().to_string();
        let roll = new.roll.clone();

        let inserted = self
            .conn
            .call({
                let id = id.clone();
                let new = new.clone();
                move |conn| {
                    let tx = conn.transaction()?;
                    let taken: bool = tx.query_row(
                        "SELECT EXISTS(SELECT 1 FROM persons WHERE roll = ?1)",
                        [&new.roll],
                        |row| row.get(0),
                    )?;
                    if taken {
                        return Ok(false);
                    }
                    tx.execute(
                        "INSERT INTO persons (id, name, roll, parent_name, phone, enrolled_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![id, new.name, new.roll, new.parent_name, new.phone, enrolled_at],
                    )?;
                    insert_signatures(&tx, &id, 0, &encoded)?;
                    tx.commit()?;
                    Ok(true)
                }
            })
            .await?;

        if !inserted {
            return Err(StoreError::DuplicateRoll(roll));
        }

        tracing::info!(
            id = %id,
            roll = %new.roll,
            signatures = signatures.len(),
            "person enrolled"
        );

        Ok(Person {
            id,
            name: new.name,
            roll: new.roll,
            parent_name: new.parent_name,
            phone: new.phone,
            signatures,
            enrolled_at,
        })
    }

    /// Append a reference signature. Returns the person's new signature count.
    pub async fn add_signature(&self, person_id: &str, signature: Signature) -> Result<usize> {
        let encoded = encode(std::slice::from_ref(&signature))?;
        let id = person_id.to_string();

        let count = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT (SELECT COUNT(*) FROM signatures WHERE person_id = p.id)
                         FROM persons p WHERE p.id = ?1",
                        [&id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(existing) = existing else {
                    return Ok(None);
                };
                let next: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(position) + 1, 0) FROM signatures WHERE person_id = ?1",
                    [&id],
                    |row| row.get(0),
                )?;
                insert_signatures(&tx, &id, next as usize, &encoded)?;
                tx.commit()?;
                Ok(Some(existing as usize + 1))
            })
            .await?;

        count.ok_or_else(|| StoreError::PersonNotFound(person_id.to_string()))
    }

    /// Replace all of a person's signatures with a new, non-empty set.
    pub async fn replace_signatures(
        &self,
        person_id: &str,
        signatures: Vec<Signature>,
    ) -> Result<()> {
        let encoded = encode(&signatures)?;
        let id = person_id.to_string();

        let found = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM persons WHERE id = ?1)",
                    [&id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Ok(false);
                }
                tx.execute("DELETE FROM signatures WHERE person_id = ?1", [&id])?;
                insert_signatures(&tx, &id, 0, &encoded)?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if !found {
            return Err(StoreError::PersonNotFound(person_id.to_string()));
        }
        tracing::info!(id = person_id, signatures = signatures.len(), "signatures replaced");
        Ok(())
    }

    pub async fn get_person(&self, person_id: &str) -> Result<Option<Person>> {
        let id = person_id.to_string();
        let person = self
            .conn
            .call(move |conn| Ok(load_person(conn, "id", &id)?))
            .await?;
        Ok(person)
    }

    pub async fn find_by_roll(&self, roll: &str) -> Result<Option<Person>> {
        let roll = roll.to_string();
        let person = self
            .conn
            .call(move |conn| Ok(load_person(conn, "roll", &roll)?))
            .await?;
        Ok(person)
    }

    /// Snapshot of every enrolled person, ordered by roll number.
    ///
    /// Read inside one transaction so a concurrent enrollment or deletion is
    /// seen either completely or not at all.
    pub async fn roster(&self) -> Result<Vec<Person>> {
        let roster = self
            .conn
            .call(|conn| {
                let tx = conn.transaction()?;
                let mut people = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {PERSON_COLUMNS} FROM persons ORDER BY roll, id"
                    ))?;
                    let people = stmt
                        .query_map([], row_to_person)?
                        .collect::<rusqlite::Result<Vec<Person>>>()?;
                    people
                };
                for person in &mut people {
                    person.signatures = load_signatures(&tx, &person.id)?;
                }
                tx.commit()?;
                Ok(people)
            })
            .await?;
        Ok(roster)
    }

    /// Delete a person. Their signatures and attendance rows go with them.
    pub async fn delete_person(&self, person_id: &str) -> Result<Person> {
        let id = person_id.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let person = load_person(&tx, "id", &id)?;
                if person.is_some() {
                    tx.execute("DELETE FROM persons WHERE id = ?1", [&id])?;
                }
                tx.commit()?;
                Ok(person)
            })
            .await?;

        let person = deleted.ok_or_else(|| StoreError::PersonNotFound(person_id.to_string()))?;
        tracing::info!(id = %person.id, roll = %person.roll, "person deleted");
        Ok(person)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sig, student};

    #[tokio::test]
    async fn test_insert_and_load_person() {
        let store = Store::open_in_memory().await.unwrap();
        let mut new = student("7A-01", "Asha");
        new.parent_name = Some("Meera".into());

        let person = store
            .insert_person(new, vec![sig(&[1.0, 0.0]), sig(&[0.9, 0.1])], Utc::now())
            .await
            .unwrap();

        let loaded = store.get_person(&person.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Asha");
        assert_eq!(loaded.parent_name.as_deref(), Some("Meera"));
        assert_eq!(loaded.signatures, person.signatures);

        let by_roll = store.find_by_roll("7A-01").await.unwrap().unwrap();
        assert_eq!(by_roll.id, person.id);
    }

    #[tokio::test]
    async fn test_duplicate_roll_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_person(student("7A-01", "Asha"), vec![sig(&[1.0])], Utc::now())
            .await
            .unwrap();

        let err = store
            .insert_person(student("7A-01", "Other"), vec![sig(&[1.0])], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRoll(roll) if roll == "7A-01"));
        assert_eq!(store.roster().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_person_requires_signature() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store
            .insert_person(student("7A-02", "Ravi"), vec![], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoSignatures));
        assert!(store.roster().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_signatures_rejected() {
        use rollcall_core::types::SignatureDefect;

        let store = Store::open_in_memory().await.unwrap();
        let cases = [
            (sig(&[]), SignatureDefect::Empty),
            (sig(&[f32::NAN, 1.0]), SignatureDefect::NonFinite),
            (sig(&[f32::INFINITY, 1.0]), SignatureDefect::NonFinite),
            (sig(&[0.0, 0.0]), SignatureDefect::ZeroNorm),
        ];
        for (bad, defect) in cases {
            let err = store
                .insert_person(student("7A-05", "Dev"), vec![sig(&[1.0, 0.0]), bad], Utc::now())
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidSignature(d) if d == defect));
        }
        assert!(store.roster().await.unwrap().is_empty());

        let person = store
            .insert_person(student("7A-05", "Dev"), vec![sig(&[1.0, 0.0])], Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            store.add_signature(&person.id, sig(&[f32::NAN, 0.0])).await,
            Err(StoreError::InvalidSignature(SignatureDefect::NonFinite))
        ));
        assert!(matches!(
            store
                .replace_signatures(&person.id, vec![sig(&[f32::NEG_INFINITY])])
                .await,
            Err(StoreError::InvalidSignature(SignatureDefect::NonFinite))
        ));

        // The roster stays readable and unchanged.
        let roster = store.roster().await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].signatures, vec![sig(&[1.0, 0.0])]);
    }

    #[tokio::test]
    async fn test_add_and_replace_signatures() {
        let store = Store::open_in_memory().await.unwrap();
        let person = store
            .insert_person(student("7A-03", "Noor"), vec![sig(&[1.0, 0.0])], Utc::now())
            .await
            .unwrap();

        let count = store.add_signature(&person.id, sig(&[0.0, 1.0])).await.unwrap();
        assert_eq!(count, 2);
        let loaded = store.get_person(&person.id).await.unwrap().unwrap();
        assert_eq!(loaded.signatures, vec![sig(&[1.0, 0.0]), sig(&[0.0, 1.0])]);

        store
            .replace_signatures(&person.id, vec![sig(&[0.5, 0.5])])
            .await
            .unwrap();
        let loaded = store.get_person(&person.id).await.unwrap().unwrap();
        assert_eq!(loaded.signatures, vec![sig(&[0.5, 0.5])]);

        assert!(matches!(
            store.replace_signatures(&person.id, vec![]).await,
            Err(StoreError::NoSignatures)
        ));
        assert!(matches!(
            store.add_signature("missing", sig(&[1.0])).await,
            Err(StoreError::PersonNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_roster_ordered_by_roll() {
        let store = Store::open_in_memory().await.unwrap();
        for (roll, name) in [("03", "C"), ("01", "A"), ("02", "B")] {
            store
                .insert_person(student(roll, name), vec![sig(&[1.0])], Utc::now())
                .await
                .unwrap();
        }
        let names: Vec<String> = store
            .roster()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_delete_person() {
        let store = Store::open_in_memory().await.unwrap();
        let person = store
            .insert_person(student("7A-04", "Kiran"), vec![sig(&[1.0])], Utc::now())
            .await
            .unwrap();

        let deleted = store.delete_person(&person.id).await.unwrap();
        assert_eq!(deleted.roll, "7A-04");
        assert!(store.get_person(&person.id).await.unwrap().is_none());
        assert!(matches!(
            store.delete_person(&person.id).await,
            Err(StoreError::PersonNotFound(_))
        ));

        // The roll number is free again.
        store
            .insert_person(student("7A-04", "Kiran"), vec![sig(&[1.0])], Utc::now())
            .await
            .unwrap();
    }
}
