//! `LedgerGuard`: the entry-validation rules PrepareTransaction runs before
//! a transaction row is ever written (invariant 1 and 5, spec.md §3.2).

use super::accounts::{find_account_by_id, Direction};
use crate::errors::{CoreError, CoreResult};
use rusqlite::Connection;

#[derive(Debug, Clone)]
pub struct EntryInput {
    pub account_id: String,
    pub direction: Direction,
    pub amount: i64,
}

pub fn validate_entries(conn: &Connection, entries: &[EntryInput]) -> CoreResult<()> {
    if entries.len() < 2 {
        return Err(CoreError::Validation(
            "a ledger transaction needs at least two entries".into(),
        ));
    }

    let debit_count = entries
        .iter()
        .filter(|e| e.direction == Direction::Debit)
        .count();
    let credit_count = entries.len() - debit_count;
    if debit_count == 0 || credit_count == 0 {
        return Err(CoreError::Validation(
            "a ledger transaction needs at least one debit and one credit".into(),
        ));
    }

    let mut currency: Option<String> = None;
    let mut debit_total: i64 = 0;
    let mut credit_total: i64 = 0;

    for entry in entries {
        if entry.amount <= 0 {
            return Err(CoreError::Validation(format!(
                "entry amount must be a positive integer, got {}",
                entry.amount
            )));
        }

        let account = find_account_by_id(conn, &entry.account_id)?.ok_or_else(|| {
            CoreError::Validation(format!("unknown account {}", entry.account_id))
        })?;

        if account.currency != "USD" {
            return Err(CoreError::Validation(format!(
                "account {} is not USD-denominated",
                account.id
            )));
        }
        match &currency {
            None => currency = Some(account.currency.clone()),
            Some(c) if *c != account.currency => {
                return Err(CoreError::Validation(
                    "all entries in a transaction must share one currency".into(),
                ))
            }
            _ => {}
        }

        super::accounts::AccountType::from_str(&account.account_type)?;

        match entry.direction {
            Direction::Debit => debit_total += entry.amount,
            Direction::Credit => credit_total += entry.amount,
        }
    }

    if debit_total != credit_total {
        return Err(CoreError::Validation(format!(
            "unbalanced transaction: debits={debit_total} credits={credit_total}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::accounts::{get_or_create_account, AccountType, OwnerType};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::Db::migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn rejects_unbalanced_entries() {
        let conn = setup();
        let float = get_or_create_account(&conn, OwnerType::Platform, "float", AccountType::Asset).unwrap();
        let escrow = get_or_create_account(&conn, OwnerType::Task, "t1", AccountType::Liability).unwrap();
        let entries = vec![
            EntryInput { account_id: float.id.clone(), direction: Direction::Debit, amount: 100 },
            EntryInput { account_id: escrow.id.clone(), direction: Direction::Credit, amount: 50 },
        ];
        assert!(validate_entries(&conn, &entries).is_err());
    }

    #[test]
    fn accepts_balanced_two_entry_transaction() {
        let conn = setup();
        let float = get_or_create_account(&conn, OwnerType::Platform, "float", AccountType::Asset).unwrap();
        let escrow = get_or_create_account(&conn, OwnerType::Task, "t1", AccountType::Liability).unwrap();
        let entries = vec![
            EntryInput { account_id: float.id.clone(), direction: Direction::Debit, amount: 100 },
            EntryInput { account_id: escrow.id.clone(), direction: Direction::Credit, amount: 100 },
        ];
        assert!(validate_entries(&conn, &entries).is_ok());
    }

    #[test]
    fn rejects_nonpositive_amount() {
        let conn = setup();
        let float = get_or_create_account(&conn, OwnerType::Platform, "float", AccountType::Asset).unwrap();
        let escrow = get_or_create_account(&conn, OwnerType::Task, "t1", AccountType::Liability).unwrap();
        let entries = vec![
            EntryInput { account_id: float.id.clone(), direction: Direction::Debit, amount: 0 },
            EntryInput { account_id: escrow.id.clone(), direction: Direction::Credit, amount: 0 },
        ];
        assert!(validate_entries(&conn, &entries).is_err());
    }
}
