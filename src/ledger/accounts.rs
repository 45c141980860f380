//! Account lookup/creation. Accounts are created lazily on first reference
//! by `(ownerType, ownerId, accountType)` and never destroyed (spec.md §3.3).

use crate::errors::{CoreError, CoreResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    Platform,
    User,
    Task,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::Platform => "platform",
            OwnerType::User => "user",
            OwnerType::Task => "task",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Expense,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Asset => "asset",
            AccountType::Liability => "liability",
            AccountType::Equity => "equity",
            AccountType::Expense => "expense",
        }
    }

    pub fn from_str(raw: &str) -> CoreResult<Self> {
        match raw {
            "asset" => Ok(AccountType::Asset),
            "liability" => Ok(AccountType::Liability),
            "equity" => Ok(AccountType::Equity),
            "expense" => Ok(AccountType::Expense),
            other => Err(CoreError::Validation(format!(
                "unrecognized account type {other}"
            ))),
        }
    }

    /// Signed rule (§4.3): assets/expenses are debit-positive, liabilities/equity are credit-positive.
    pub fn signed_delta(&self, direction: Direction, amount: i64) -> i64 {
        let positive = matches!(
            (self, direction),
            (AccountType::Asset, Direction::Debit)
                | (AccountType::Expense, Direction::Debit)
                | (AccountType::Liability, Direction::Credit)
                | (AccountType::Equity, Direction::Credit)
        );
        if positive {
            amount
        } else {
            -amount
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }

    pub fn from_str(raw: &str) -> CoreResult<Self> {
        match raw {
            "debit" => Ok(Direction::Debit),
            "credit" => Ok(Direction::Credit),
            other => Err(CoreError::Validation(format!(
                "unrecognized entry direction {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub owner_type: String,
    pub owner_id: String,
    pub account_type: String,
    pub currency: String,
    pub balance: i64,
    pub baseline_balance: i64,
    pub baseline_tx_id: Option<String>,
}

pub fn get_or_create_account(
    conn: &Connection,
    owner_type: OwnerType,
    owner_id: &str,
    account_type: AccountType,
) -> CoreResult<Account> {
    if let Some(account) = find_account(conn, owner_type, owner_id, account_type)? {
        return Ok(account);
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let inserted = conn.execute(
        "INSERT INTO accounts (id, owner_type, owner_id, account_type, currency, balance, baseline_balance, created_at)
         VALUES (?1, ?2, ?3, ?4, 'USD', 0, 0, ?5)
         ON CONFLICT(owner_type, owner_id, account_type) DO NOTHING",
        params![id, owner_type.as_str(), owner_id, account_type.as_str(), now],
    )?;
    if inserted == 0 {
        // Lost a creation race; the row now exists under the other writer's id.
        return find_account(conn, owner_type, owner_id, account_type)?.ok_or_else(|| {
            CoreError::Integrity(format!(
                "account {}/{}/{} vanished after race",
                owner_type.as_str(),
                owner_id,
                account_type.as_str()
            ))
        });
    }

    find_account(conn, owner_type, owner_id, account_type)?.ok_or_else(|| {
        CoreError::Integrity(format!(
            "just-inserted account {}/{}/{} not found",
            owner_type.as_str(),
            owner_id,
            account_type.as_str()
        ))
    })
}

pub fn find_account(
    conn: &Connection,
    owner_type: OwnerType,
    owner_id: &str,
    account_type: AccountType,
) -> CoreResult<Option<Account>> {
    conn.query_row(
        "SELECT id, owner_type, owner_id, account_type, currency, balance, baseline_balance, baseline_tx_id
         FROM accounts WHERE owner_type = ?1 AND owner_id = ?2 AND account_type = ?3",
        params![owner_type.as_str(), owner_id, account_type.as_str()],
        row_to_account,
    )
    .optional()
    .map_err(CoreError::from)
}

pub fn find_account_by_id(conn: &Connection, account_id: &str) -> CoreResult<Option<Account>> {
    conn.query_row(
        "SELECT id, owner_type, owner_id, account_type, currency, balance, baseline_balance, baseline_tx_id
         FROM accounts WHERE id = ?1",
        params![account_id],
        row_to_account,
    )
    .optional()
    .map_err(CoreError::from)
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        owner_type: row.get(1)?,
        owner_id: row.get(2)?,
        account_type: row.get(3)?,
        currency: row.get(4)?,
        balance: row.get(5)?,
        baseline_balance: row.get(6)?,
        baseline_tx_id: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::Db::migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn creates_account_lazily_and_is_idempotent() {
        let conn = setup();
        let a = get_or_create_account(&conn, OwnerType::Platform, "float", AccountType::Asset).unwrap();
        let b = get_or_create_account(&conn, OwnerType::Platform, "float", AccountType::Asset).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn signed_delta_follows_accounting_rule() {
        assert_eq!(AccountType::Asset.signed_delta(Direction::Debit, 100), 100);
        assert_eq!(AccountType::Asset.signed_delta(Direction::Credit, 100), -100);
        assert_eq!(AccountType::Liability.signed_delta(Direction::Credit, 100), 100);
        assert_eq!(AccountType::Liability.signed_delta(Direction::Debit, 100), -100);
    }
}
