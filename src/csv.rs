use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::model::{ClientFingerprint, CounterpartyId, Request, UserId};
use crate::Points;

/// Errors that can occur when reading or writing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open csv input: {0}")]
    Open(#[source] csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized request type '{request_type}'")]
    UnrecognizedType { line: usize, request_type: String },

    #[error("line {line}: {request_type} missing amount")]
    MissingAmount { line: usize, request_type: String },

    #[error("line {line}: redeem missing coupon code")]
    MissingCode { line: usize },

    #[error("failed to write csv output: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush csv output: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    user: UserId,
    amount: Option<i64>,
    code: Option<String>,
    counterparty: Option<CounterpartyId>,
    client: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    user: UserId,
    balance: String,
    transactions: usize,
}

/// Read requests from a csv file, each with the fingerprint of its client
pub fn read_requests(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<(Request, ClientFingerprint), CsvError>>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(CsvError::Open)?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let client = ClientFingerprint {
                origin: row.client.clone(),
                signature: None,
            };
            let amount = |request_type: &str| {
                row.amount
                    .map(Points::new)
                    .ok_or_else(|| CsvError::MissingAmount {
                        line,
                        request_type: request_type.to_string(),
                    })
            };
            let request = match row.r#type.as_str() {
                "purchase" => Request::Purchase {
                    user: row.user,
                    amount: amount("purchase")?,
                },
                "consume" => Request::Consume {
                    user: row.user,
                    amount: amount("consume")?,
                    counterparty: row.counterparty,
                },
                "refund" => Request::Refund {
                    user: row.user,
                    amount: amount("refund")?,
                },
                "adjust" => Request::Adjust {
                    user: row.user,
                    delta: amount("adjust")?,
                },
                "redeem" => Request::Redeem {
                    user: row.user,
                    code: row
                        .code
                        .clone()
                        .filter(|c| !c.is_empty())
                        .ok_or(CsvError::MissingCode { line })?,
                },
                other => {
                    return Err(CsvError::UnrecognizedType {
                        line,
                        request_type: other.to_string(),
                    });
                }
            };
            Ok((request, client))
        }))
}

/// Write `(user, balance, transaction count)` rows in csv format
pub fn write_balances<W: io::Write>(
    writer: W,
    accounts: impl IntoIterator<Item = (UserId, Points, usize)>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for (user, balance, transactions) in accounts {
        writer.serialize(OutputRow {
            user,
            balance: balance.to_string(),
            transactions,
        })?;
    }

    writer.flush()?;
    Ok(())
}
