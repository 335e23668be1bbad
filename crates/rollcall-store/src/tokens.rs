//! Daily verification codes.

use crate::{Result, Store};
use chrono::{NaiveDate, Utc};
use rand::Rng;
use rollcall_core::DailyToken;
use rusqlite::{params, OptionalExtension, Row};

fn row_to_token(row: &Row) -> rusqlite::Result<DailyToken> {
    Ok(DailyToken {
        date: row.get(0)?,
        code: row.get(1)?,
        created_at: row.get(2)?,
    })
}

/// Six-digit code, never starting with zero.
fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..1_000_000).to_string()
}

impl Store {
    /// The code for `date`, created on first request and fixed afterwards.
    pub async fn token_for(&self, date: NaiveDate) -> Result<DailyToken> {
        let candidate = generate_code();
        let (token, created) = self
            .conn
            .call(move |conn| {
                let created = conn.execute(
                    "INSERT OR IGNORE INTO daily_tokens (date, code, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![date, candidate, Utc::now()],
                )?;
                let token = conn.query_row(
                    "SELECT date, code, created_at FROM daily_tokens WHERE date = ?1",
                    [date],
                    row_to_token,
                )?;
                Ok((token, created > 0))
            })
            .await?;

        if created {
            tracing::info!(date = %date, "daily token created");
        }
        Ok(token)
    }

    /// The code for `date` if one was ever issued.
    pub async fn existing_token(&self, date: NaiveDate) -> Result<Option<DailyToken>> {
        let token = self
            .conn
            .call(move |conn| {
                let token = conn
                    .query_row(
                        "SELECT date, code, created_at FROM daily_tokens WHERE date = ?1",
                        [date],
                        row_to_token,
                    )
                    .optional()?;
                Ok(token)
            })
            .await?;
        Ok(token)
    }

    /// Check a submitted code against the day's code. Never issues a code.
    pub async fn verify_token(&self, date: NaiveDate, code: &str) -> Result<bool> {
        let valid = self
            .existing_token(date)
            .await?
            .is_some_and(|token| token.code == code.trim());
        if !valid {
            tracing::warn!(date = %date, "daily code rejected");
        }
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, d).unwrap()
    }

    #[test]
    fn test_generate_code_shape() {
        for _ in 0..200 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(!code.starts_with('0'));
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_token_created_once_per_date() {
        let store = Store::open_in_memory().await.unwrap();

        let first = store.token_for(day(2)).await.unwrap();
        for _ in 0..5 {
            assert_eq!(store.token_for(day(2)).await.unwrap(), first);
        }
        let other = store.token_for(day(3)).await.unwrap();
        assert_eq!(other.date, day(3));
    }

    #[tokio::test]
    async fn test_verify_token() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(!store.verify_token(day(2), "123456").await.unwrap());
        assert!(store.existing_token(day(2)).await.unwrap().is_none());

        let token = store.token_for(day(2)).await.unwrap();
        assert!(store.verify_token(day(2), &token.code).await.unwrap());
        assert!(store.verify_token(day(2), &format!(" {} ", token.code)).await.unwrap());
        assert!(!store.verify_token(day(3), &token.code).await.unwrap());
        assert!(!store.verify_token(day(2), "000000").await.unwrap());
    }
}
