//! Block payload to table rows.

use std::collections::BTreeSet;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use error_stack::{Report, Result, ResultExt};
use sha2::{Digest, Sha256};

use crate::{
    provider::{models::Event, BlockWithResults},
    store::{BlockRow, EventRow, EventSource, IndexedBlock, TransactionRow},
};

use super::ProcessorError;

/// Convert a fetched block into the rows stored for its height.
pub fn index_block(item: &BlockWithResults) -> Result<IndexedBlock, ProcessorError> {
    let height = item.height;
    let header = &item.block.block.header;

    let header_height = parse_integer::<u64>(&header.height, "header height", height)?;
    if header_height != height {
        return Err(Report::new(ProcessorError::InvalidBlock))
            .attach_printable(format!("header height {header_height} does not match"))
            .attach_printable(format!("height: {height}"));
    }

    let results_height = parse_integer::<u64>(&item.results.height, "results height", height)?;
    if results_height != height {
        return Err(Report::new(ProcessorError::InvalidBlock))
            .attach_printable(format!("results height {results_height} does not match"))
            .attach_printable(format!("height: {height}"));
    }

    let time = DateTime::parse_from_rfc3339(&header.time)
        .change_context(ProcessorError::InvalidBlock)
        .attach_printable_lazy(|| format!("invalid block time: {}", header.time))
        .attach_printable_lazy(|| format!("height: {height}"))?
        .with_timezone(&Utc);

    let txs = &item.block.block.data.txs;
    let txs_results = &item.results.txs_results;
    if txs.len() != txs_results.len() {
        return Err(Report::new(ProcessorError::InvalidBlock))
            .attach_printable(format!(
                "block has {} transactions but {} results",
                txs.len(),
                txs_results.len()
            ))
            .attach_printable(format!("height: {height}"));
    }

    let mut transactions = Vec::with_capacity(txs.len());
    let mut events = Vec::new();

    for (tx_index, (raw, result)) in txs.iter().zip(txs_results).enumerate() {
        let tx_index = tx_index as u32;
        let hash = tx_hash(raw, height)?;

        let gas_used = parse_gas(result.gas_used.as_deref(), "gas used", height)?;
        let gas_wanted = parse_gas(result.gas_wanted.as_deref(), "gas wanted", height)?;

        let senders = result
            .events
            .iter()
            .filter(|event| event.kind == "message")
            .filter_map(|event| event.attribute("sender"))
            .filter(|sender| !sender.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();

        for (event_index, event) in result.events.iter().enumerate() {
            events.push(event_row(
                height,
                Some(&hash),
                EventSource::Tx,
                tx_index,
                event_index as u32,
                event,
            )?);
        }

        let status = if result.code == 0 { "success" } else { "failed" };

        transactions.push(TransactionRow {
            hash,
            block_height: height,
            tx_index,
            status: status.to_string(),
            code: result.code,
            codespace: result.codespace.clone(),
            gas_used,
            gas_wanted,
            raw_log: result.log.clone(),
            time,
            events: to_json(&result.events, height)?,
            senders,
        });
    }

    let block_events = [
        (EventSource::BeginBlock, &item.results.begin_block_events),
        (EventSource::EndBlock, &item.results.end_block_events),
        (EventSource::FinalizeBlock, &item.results.finalize_block_events),
    ];

    for (source, source_events) in block_events {
        for (event_index, event) in source_events.iter().enumerate() {
            events.push(event_row(
                height,
                None,
                source,
                0,
                event_index as u32,
                event,
            )?);
        }
    }

    let block = BlockRow {
        height,
        hash: item.block.block_id.hash.clone(),
        chain_id: header.chain_id.clone(),
        proposer_address: header.proposer_address.clone(),
        time,
        tx_count: transactions.len() as u32,
        gas_used: transactions.iter().map(|tx| tx.gas_used).sum(),
        gas_wanted: transactions.iter().map(|tx| tx.gas_wanted).sum(),
        evidence_count: item.block.block.evidence.evidence.len() as u32,
    };

    Ok(IndexedBlock {
        block,
        transactions,
        events,
    })
}

/// Upper case hex sha256 of the raw transaction bytes.
pub fn tx_hash(raw: &str, height: u64) -> Result<String, ProcessorError> {
    let bytes = BASE64
        .decode(raw)
        .change_context(ProcessorError::InvalidBlock)
        .attach_printable("transaction is not valid base64")
        .attach_printable_lazy(|| format!("height: {height}"))?;

    Ok(hex::encode_upper(Sha256::digest(bytes)))
}

/// Module that emitted the event.
///
/// Uses the `module` attribute if present, otherwise the package of typed
/// events (`cosmos.bank.v1beta1.EventSend` is `bank`).
pub fn event_module(event: &Event) -> String {
    if let Some(module) = event.attribute("module") {
        if !module.is_empty() {
            return module.to_string();
        }
    }

    event
        .kind
        .split('.')
        .nth(1)
        .filter(|module| !module.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

fn event_row(
    height: u64,
    tx_hash: Option<&str>,
    source: EventSource,
    tx_index: u32,
    event_index: u32,
    event: &Event,
) -> Result<EventRow, ProcessorError> {
    Ok(EventRow {
        block_height: height,
        tx_hash: tx_hash.map(str::to_string),
        source,
        tx_index,
        event_index,
        event_type: event.kind.clone(),
        module: event_module(event),
        attributes: to_json(&event.attributes, height)?,
    })
}

fn parse_integer<T>(value: &str, field: &'static str, height: u64) -> Result<T, ProcessorError>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .change_context(ProcessorError::InvalidBlock)
        .attach_printable_lazy(|| format!("invalid {field}: {value:?}"))
        .attach_printable_lazy(|| format!("height: {height}"))
}

fn parse_gas(value: Option<&str>, field: &'static str, height: u64) -> Result<i64, ProcessorError> {
    match value {
        None | Some("") => Ok(0),
        Some(value) => parse_integer(value, field, height),
    }
}

fn to_json<T: serde::Serialize>(value: &T, height: u64) -> Result<String, ProcessorError> {
    serde_json::to_string(value)
        .change_context(ProcessorError::InvalidBlock)
        .attach_printable("failed to serialize events")
        .attach_printable_lazy(|| format!("height: {height}"))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use crate::{
        processor::{fixtures, ProcessorError},
        provider::models::Event,
        store::EventSource,
    };

    use super::{event_module, index_block, tx_hash};

    #[test]
    fn test_index_block() {
        let item = fixtures::block_with_results(7, 2);
        let indexed = index_block(&item).unwrap();

        assert_eq!(indexed.block.height, 7);
        assert_eq!(indexed.block.tx_count, 2);
        assert_eq!(indexed.block.gas_used, 200);
        assert_eq!(indexed.block.gas_wanted, 400);
        assert_eq!(indexed.block.time.timestamp(), 1_704_067_200);

        assert_eq!(indexed.transactions.len(), 2);
        let tx = &indexed.transactions[1];
        assert_eq!(tx.tx_index, 1);
        assert_eq!(tx.status, "success");
        assert_eq!(tx.hash.len(), 64);
        assert!(tx.senders.contains("addr-7-1"));

        let block_events = indexed
            .events
            .iter()
            .filter(|event| event.source == EventSource::FinalizeBlock)
            .count();
        assert_eq!(block_events, 1);
        assert_eq!(indexed.events.len(), 3);
    }

    #[test]
    fn test_tx_hash_is_uppercase_sha256() {
        // sha256("hello")
        let hash = tx_hash("aGVsbG8=", 1).unwrap();
        assert_eq!(
            hash,
            "2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824"
        );

        let err = tx_hash("not base64!", 1).unwrap_err();
        assert_eq!(err.current_context(), &ProcessorError::InvalidBlock);
    }

    #[test]
    fn test_header_height_must_match() {
        let mut item = fixtures::block_with_results(7, 1);
        item.block.block.header.height = "8".to_string();

        let err = index_block(&item).unwrap_err();
        assert_matches!(err.current_context(), ProcessorError::InvalidBlock);
    }

    #[test]
    fn test_transaction_count_must_match() {
        let mut item = fixtures::block_with_results(7, 2);
        item.results.txs_results.pop();

        let err = index_block(&item).unwrap_err();
        assert_matches!(err.current_context(), ProcessorError::InvalidBlock);
    }

    #[test]
    fn test_gas_must_be_integer() {
        let mut item = fixtures::block_with_results(7, 1);
        item.results.txs_results[0].gas_used = Some("lots".to_string());

        let err = index_block(&item).unwrap_err();
        assert_matches!(err.current_context(), ProcessorError::InvalidBlock);
    }

    #[test]
    fn test_event_module() {
        let with_attribute: Event = serde_json::from_value(json!({
            "type": "message",
            "attributes": [{ "key": "module", "value": "staking" }]
        }))
        .unwrap();
        assert_eq!(event_module(&with_attribute), "staking");

        let typed: Event = serde_json::from_value(json!({
            "type": "cosmos.bank.v1beta1.EventSend",
            "attributes": []
        }))
        .unwrap();
        assert_eq!(event_module(&typed), "bank");

        let plain: Event = serde_json::from_value(json!({ "type": "transfer" })).unwrap();
        assert_eq!(event_module(&plain), "unknown");
    }
}
