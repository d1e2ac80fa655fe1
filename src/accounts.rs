// Copyright (c) 2025 - Cowboy AI, Inc.
//! Accounts Reference Domain
//!
//! A small bank account aggregate used by the `command-server` binary and the
//! integration tests.
//!
//! # Schema History
//!
//! | Version | Shape |
//! |---|---|
//! | 0 | `identifier, sequence, version, updatedOn, balance` |
//! | 1 | adds `currency` (documents written at v0 become `"EUR"`) |
//!
//! # Commands
//!
//! The handler reads the `operation` field of the command body:
//!
//! ```text
//! {"operation": "open", "currency": "USD"}   currency optional, defaults to EUR
//! {"operation": "deposit", "amount": 250}
//! {"operation": "withdraw", "amount": 100}
//! ```
//!
//! Amounts are integers in minor units. The handler is pure: it takes its
//! clock from the command timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::{Aggregate, Command, Handler};
use crate::errors::ConfigurationError;
use crate::upcasting::{set_document_version, UpcastError, Upcaster, UpcasterChain};

/// Current schema version of [`Account`]
pub const ACCOUNT_VERSION: i32 = 1;

/// Currency assigned to accounts that predate the `currency` field
pub const DEFAULT_CURRENCY: &str = "EUR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub identifier: i64,
    pub sequence: i64,
    pub version: i32,
    #[serde(default)]
    pub updated_on: DateTime<Utc>,
    pub currency: String,
    pub balance: i64,
}

impl Aggregate for Account {
    fn identifier(&self) -> i64 {
        self.identifier
    }

    fn sequence(&self) -> i64 {
        self.sequence
    }

    fn version(&self) -> i32 {
        self.version
    }

    fn updated_on(&self) -> DateTime<Utc> {
        self.updated_on
    }
}

/// v0 → v1: introduces `currency`
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrencyUpcaster;

impl Upcaster for CurrencyUpcaster {
    fn from_version(&self) -> i32 {
        0
    }

    fn upcast(&self, mut document: Value) -> Result<Value, UpcastError> {
        set_document_version(&mut document, 1)?;
        if let Some(fields) = document.as_object_mut() {
            fields.insert("currency".to_string(), json!(DEFAULT_CURRENCY));
        }
        Ok(document)
    }

    fn validate(&self, document: &Value) -> Result<(), UpcastError> {
        match document.get("currency") {
            Some(Value::String(_)) => Ok(()),
            _ => Err(UpcastError::MissingField("currency".to_string())),
        }
    }
}

/// Upcasters taking any stored account to [`ACCOUNT_VERSION`]
pub fn account_upcasters() -> Result<UpcasterChain, ConfigurationError> {
    UpcasterChain::new(ACCOUNT_VERSION).with(CurrencyUpcaster)
}

/// Business rule violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("Account {0} is already open")]
    AlreadyOpen(i64),

    #[error("Account {0} has not been opened")]
    NotOpened(i64),

    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(i64),

    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },

    #[error("Balance overflow")]
    Overflow,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Operation carried in a command body
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum Operation {
    Open {
        #[serde(default)]
        currency: Option<String>,
    },
    Deposit {
        amount: i64,
    },
    Withdraw {
        amount: i64,
    },
}

impl Operation {
    /// Read the operation out of a command body
    pub fn from_command(command: &Command) -> Result<Self, AccountError> {
        serde_json::from_value(Value::Object(command.body.clone()))
            .map_err(|e| AccountError::InvalidOperation(e.to_string()))
    }
}

/// Applies [`Operation`]s to accounts
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountHandler;

impl AccountHandler {
    fn open(command: &Command, currency: Option<String>) -> Account {
        Account {
            identifier: command.identifier,
            sequence: 0,
            version: ACCOUNT_VERSION,
            updated_on: command.timestamp,
            currency: currency.unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            balance: 0,
        }
    }

    fn with_balance(previous: &Account, command: &Command, balance: i64) -> Account {
        Account {
            sequence: previous.sequence + 1,
            updated_on: command.timestamp,
            balance,
            ..previous.clone()
        }
    }

    /// Compute the next account state
    ///
    /// # Business Rules
    /// - An account is opened exactly once
    /// - Deposits and withdrawals need an open account and a positive amount
    /// - A withdrawal may not exceed the balance
    pub fn apply(
        previous: Option<&Account>,
        command: &Command,
    ) -> Result<Account, AccountError> {
        let operation = Operation::from_command(command)?;

        match (previous, operation) {
            (None, Operation::Open { currency }) => Ok(Self::open(command, currency)),
            (Some(_), Operation::Open { .. }) => Err(AccountError::AlreadyOpen(command.identifier)),
            (None, _) => Err(AccountError::NotOpened(command.identifier)),
            (Some(account), Operation::Deposit { amount }) => {
                if amount <= 0 {
                    return Err(AccountError::NonPositiveAmount(amount));
                }
                let balance = account
                    .balance
                    .checked_add(amount)
                    .ok_or(AccountError::Overflow)?;
                Ok(Self::with_balance(account, command, balance))
            }
            (Some(account), Operation::Withdraw { amount }) => {
                if amount <= 0 {
                    return Err(AccountError::NonPositiveAmount(amount));
                }
                if amount > account.balance {
                    return Err(AccountError::InsufficientFunds {
                        balance: account.balance,
                        requested: amount,
                    });
                }
                Ok(Self::with_balance(account, command, account.balance - amount))
            }
        }
    }
}

impl Handler<Account> for AccountHandler {
    fn handle(&self, previous: Option<&Account>, command: &Command) -> anyhow::Result<Account> {
        Ok(Self::apply(previous, command)?)
    }
}
