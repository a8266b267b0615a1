//! Deterministic placeholder financial data for development environments.
//!
//! Everything produced here is flagged through [`Fetched::synthetic`] by the
//! aggregator client; ids carry a `synthetic-` prefix so a stray record is
//! recognizable at a glance. No randomness: the same date range always
//! yields the same transactions.

use chrono::{Datelike, NaiveDate};

use crate::api::types::{Account, Balances, Transaction};

const MERCHANTS: [(&str, &str, f64); 5] = [
    ("Corner Grocer", "Food and Drink", 42.17),
    ("Transit Pass", "Travel", 2.75),
    ("Steam Cafe", "Food and Drink", 6.40),
    ("Harbor Utilities", "Utilities", 31.05),
    ("Page One Books", "Shops", 18.99),
];

pub fn accounts() -> Vec<Account> {
    vec![
        Account {
            account_id: "synthetic-checking".into(),
            name: "Everyday Checking".into(),
            official_name: Some("Synthetic Everyday Checking".into()),
            account_type: "depository".into(),
            subtype: Some("checking".into()),
            mask: Some("0000".into()),
            balances: Balances {
                available: Some(1_274.93),
                current: Some(1_274.93),
                iso_currency_code: Some("USD".into()),
            },
        },
        Account {
            account_id: "synthetic-savings".into(),
            name: "Rainy Day Savings".into(),
            official_name: Some("Synthetic Rainy Day Savings".into()),
            account_type: "depository".into(),
            subtype: Some("savings".into()),
            mask: Some("1111".into()),
            balances: Balances {
                available: Some(8_350.00),
                current: Some(8_350.00),
                iso_currency_code: Some("USD".into()),
            },
        },
        Account {
            account_id: "synthetic-credit".into(),
            name: "Travel Rewards Card".into(),
            official_name: Some("Synthetic Travel Rewards Card".into()),
            account_type: "credit".into(),
            subtype: Some("credit card".into()),
            mask: Some("2222".into()),
            balances: Balances {
                available: Some(4_520.50),
                current: Some(479.50),
                iso_currency_code: Some("USD".into()),
            },
        },
    ]
}

/// One transaction per merchant per day across the inclusive range, amounts
/// varied by day-of-month so charts have some shape.
pub fn transactions(start: NaiveDate, end: NaiveDate) -> Vec<Transaction> {
    let mut out = Vec::new();
    let mut date = start;
    while date <= end {
        let day = date.day();
        for (index, (name, category, base_amount)) in MERCHANTS.iter().enumerate() {
            // Each merchant charges on its own cadence.
            if day % (index as u32 + 2) != 0 {
                continue;
            }
            let amount = base_amount + (day % 7) as f64 * 0.5;
            out.push(Transaction {
                transaction_id: format!("synthetic-{date}-{index}"),
                account_id: "synthetic-checking".into(),
                name: (*name).into(),
                amount: (amount * 100.0).round() / 100.0,
                date,
                pending: false,
                category: Some((*category).into()),
            });
        }
        date = match date.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    out
}
