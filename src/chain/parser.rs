//! Binary transaction and block decoding.
//!
//! Decodes the standard Bitcoin wire serialisation as delivered over the
//! node's rawtx/rawblock topics. Identifiers are the double SHA-256 of the
//! transaction serialised without the segwit marker, flag, and witness
//! blocks, byte-reversed and hex-encoded, so they match what the node RPC
//! reports.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::oracle::filter::{InputSummary, OutputSummary, TxSummary};

const SATS_PER_BTC: f64 = 100_000_000.0;
const OP_RETURN: u8 = 0x6a;

/// Offset of the timestamp field inside an 80-byte block header.
const HEADER_TIME_OFFSET: usize = 68;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("transaction data truncated reading {0}")]
    Truncated(&'static str),
    #[error("varint length {0} exceeds remaining data")]
    BadVarint(u64),
    #[error("{0} trailing bytes after locktime")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxInput {
    /// Spent transaction id in display (byte-reversed) hex.
    pub prev_txid: String,
    pub prev_index: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TxInput {
    pub fn is_coinbase(&self) -> bool {
        self.prev_index == u32::MAX && self.prev_txid.bytes().all(|b| b == b'0')
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxOutput {
    pub value_sats: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn value_btc(&self) -> f64 {
        self.value_sats as f64 / SATS_PER_BTC
    }

    pub fn is_op_return(&self) -> bool {
        self.script_pubkey.first() == Some(&OP_RETURN)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTransaction {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
    pub segwit: bool,
}

impl ParsedTransaction {
    /// Display-order transaction id.
    pub fn txid(&self) -> String {
        let legacy = self.serialize_without_witness();
        let first = Sha256::digest(&legacy);
        let mut digest = Sha256::digest(first);
        digest.reverse();
        hex::encode(digest)
    }

    /// View consumed by the payment filter.
    pub fn to_summary(&self) -> TxSummary {
        TxSummary {
            txid: self.txid(),
            inputs: self
                .inputs
                .iter()
                .map(|input| InputSummary {
                    prev_txid: input.prev_txid.clone(),
                    coinbase: input.is_coinbase(),
                    witness_lens: input.witness.iter().map(|item| item.len()).collect(),
                })
                .collect(),
            outputs: self
                .outputs
                .iter()
                .map(|output| OutputSummary {
                    value_btc: output.value_btc(),
                    op_return: output.is_op_return(),
                })
                .collect(),
        }
    }

    fn serialize_without_witness(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        push_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            // Stored display-order, serialised little-endian.
            let mut hash = hex::decode(&input.prev_txid).unwrap_or_else(|_| vec![0u8; 32]);
            hash.reverse();
            out.extend_from_slice(&hash);
            out.extend_from_slice(&input.prev_index.to_le_bytes());
            push_varint(&mut out, input.script_sig.len() as u64);
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        push_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.value_sats.to_le_bytes());
            push_varint(&mut out, output.script_pubkey.len() as u64);
            out.extend_from_slice(&output.script_pubkey);
        }
        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }
}

/// A decoded raw block: header time, recovered height, transactions.
#[derive(Debug, Clone)]
pub struct ParsedBlock {
    pub timestamp: u32,
    /// Height from the coinbase BIP34 push, when present and well-formed.
    pub height: Option<u64>,
    pub transactions: Vec<ParsedTransaction>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.data.get(self.pos + offset).copied()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ParseError> {
        if self.remaining() < n {
            return Err(ParseError::Truncated(what));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32_le(&mut self, what: &'static str) -> Result<u32, ParseError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32_le(&mut self, what: &'static str) -> Result<i32, ParseError> {
        let bytes = self.take(4, what)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64_le(&mut self, what: &'static str) -> Result<u64, ParseError> {
        let bytes = self.take(8, what)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Bitcoin compact size: 1, 3, 5, or 9 bytes.
    fn varint(&mut self) -> Result<u64, ParseError> {
        let first = self.take(1, "varint")?[0];
        match first {
            0..=0xfc => Ok(first as u64),
            0xfd => {
                let bytes = self.take(2, "varint16")?;
                Ok(u16::from_le_bytes([bytes[0], bytes[1]]) as u64)
            }
            0xfe => Ok(self.u32_le("varint32")? as u64),
            0xff => self.u64_le("varint64"),
        }
    }

    /// A varint-prefixed byte string, bounds-checked before slicing.
    fn var_bytes(&mut self, what: &'static str) -> Result<&'a [u8], ParseError> {
        let len = self.varint()?;
        if len > self.remaining() as u64 {
            return Err(ParseError::BadVarint(len));
        }
        self.take(len as usize, what)
    }
}

fn push_varint(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

/// Parse one standalone transaction; the buffer must contain exactly one.
pub fn parse_transaction(raw: &[u8]) -> Result<ParsedTransaction, ParseError> {
    let mut cursor = Cursor::new(raw);
    let tx = parse_transaction_at(&mut cursor)?;
    if cursor.remaining() > 0 {
        return Err(ParseError::TrailingBytes(cursor.remaining()));
    }
    Ok(tx)
}

fn parse_transaction_at(cursor: &mut Cursor<'_>) -> Result<ParsedTransaction, ParseError> {
    let version = cursor.i32_le("version")?;

    // Segwit marker 0x00 + flag 0x01; a lone 0x00 would be a zero-input
    // transaction, which the varint path rejects naturally.
    let segwit = cursor.peek(0) == Some(0x00) && cursor.peek(1) == Some(0x01);
    if segwit {
        cursor.take(2, "segwit marker")?;
    }

    let input_count = cursor.varint()?;
    if input_count > cursor.remaining() as u64 {
        return Err(ParseError::BadVarint(input_count));
    }

    let mut inputs = Vec::with_capacity(input_count as usize);
    for _ in 0..input_count {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(cursor.take(32, "prev hash")?);
        hash.reverse();
        let prev_txid = hex::encode(hash);
        let prev_index = cursor.u32_le("prev index")?;
        let script_sig = cursor.var_bytes("script sig")?.to_vec();
        let sequence = cursor.u32_le("sequence")?;
        inputs.push(TxInput {
            prev_txid,
            prev_index,
            script_sig,
            sequence,
            witness: Vec::new(),
        });
    }

    let output_count = cursor.varint()?;
    if output_count > cursor.remaining() as u64 {
        return Err(ParseError::BadVarint(output_count));
    }

    let mut outputs = Vec::with_capacity(output_count as usize);
    for _ in 0..output_count {
        let value_sats = cursor.u64_le("output value")?;
        let script_pubkey = cursor.var_bytes("script pubkey")?.to_vec();
        outputs.push(TxOutput {
            value_sats,
            script_pubkey,
        });
    }

    if segwit {
        for input in &mut inputs {
            let item_count = cursor.varint()?;
            if item_count > cursor.remaining() as u64 {
                return Err(ParseError::BadVarint(item_count));
            }
            let mut witness = Vec::with_capacity(item_count as usize);
            for _ in 0..item_count {
                witness.push(cursor.var_bytes("witness item")?.to_vec());
            }
            input.witness = witness;
        }
    }

    let locktime = cursor.u32_le("locktime")?;

    Ok(ParsedTransaction {
        version,
        inputs,
        outputs,
        locktime,
        segwit,
    })
}

/// Parse a raw block: 80-byte header, tx count, transactions.
pub fn parse_block(raw: &[u8]) -> Result<ParsedBlock, ParseError> {
    let mut cursor = Cursor::new(raw);
    let header = cursor.take(80, "block header")?;
    let timestamp = u32::from_le_bytes([
        header[HEADER_TIME_OFFSET],
        header[HEADER_TIME_OFFSET + 1],
        header[HEADER_TIME_OFFSET + 2],
        header[HEADER_TIME_OFFSET + 3],
    ]);

    let tx_count = cursor.varint()?;
    if tx_count > cursor.remaining() as u64 {
        return Err(ParseError::BadVarint(tx_count));
    }

    let mut transactions = Vec::with_capacity(tx_count as usize);
    for _ in 0..tx_count {
        transactions.push(parse_transaction_at(&mut cursor)?);
    }

    let height = transactions.first().and_then(bip34_height);

    Ok(ParsedBlock {
        timestamp,
        height,
        transactions,
    })
}

/// Height from the coinbase scriptSig's leading BIP34 push.
fn bip34_height(coinbase: &ParsedTransaction) -> Option<u64> {
    let input = coinbase.inputs.first()?;
    if !input.is_coinbase() {
        return None;
    }
    let script = &input.script_sig;
    let push_len = *script.first()? as usize;
    if push_len == 0 || push_len > 8 || script.len() < 1 + push_len {
        return None;
    }
    let mut height = 0u64;
    for (i, byte) in script[1..1 + push_len].iter().enumerate() {
        height |= (*byte as u64) << (8 * i);
    }
    Some(height)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
        push_varint(out, bytes.len() as u64);
        out.extend_from_slice(bytes);
    }

    fn build_input(out: &mut Vec<u8>, prev: [u8; 32], index: u32, script: &[u8]) {
        out.extend_from_slice(&prev);
        out.extend_from_slice(&index.to_le_bytes());
        push_bytes(out, script);
        out.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    }

    fn build_output(out: &mut Vec<u8>, sats: u64, script: &[u8]) {
        out.extend_from_slice(&sats.to_le_bytes());
        push_bytes(out, script);
    }

    /// 1-in 2-out legacy transaction.
    fn legacy_tx_bytes() -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&2i32.to_le_bytes());
        raw.push(1);
        build_input(&mut raw, [0x11; 32], 0, &[0x51]);
        raw.push(2);
        build_output(&mut raw, 100_000, &[0x00, 0x14]);
        build_output(&mut raw, 250_000, &[0x51]);
        raw.extend_from_slice(&0u32.to_le_bytes());
        raw
    }

    /// Same transaction with a marker, flag, and one witness stack.
    fn segwit_tx_bytes() -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&2i32.to_le_bytes());
        raw.push(0x00);
        raw.push(0x01);
        raw.push(1);
        build_input(&mut raw, [0x11; 32], 0, &[0x51]);
        raw.push(2);
        build_output(&mut raw, 100_000, &[0x00, 0x14]);
        build_output(&mut raw, 250_000, &[0x51]);
        raw.push(2); // witness items for the single input
        push_bytes(&mut raw, &[0xaa; 72]);
        push_bytes(&mut raw, &[0xbb; 33]);
        raw.extend_from_slice(&0u32.to_le_bytes());
        raw
    }

    #[test]
    fn test_parse_legacy_transaction() {
        let tx = parse_transaction(&legacy_tx_bytes()).unwrap();
        assert_eq!(tx.version, 2);
        assert!(!tx.segwit);
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].value_sats, 100_000);
        assert_eq!(tx.outputs[0].value_btc(), 0.001);
        assert_eq!(tx.locktime, 0);
        // Prev hash comes out byte-reversed into display order.
        assert_eq!(tx.inputs[0].prev_txid, "11".repeat(32));
    }

    #[test]
    fn test_segwit_txid_matches_stripped_serialization() {
        let legacy = parse_transaction(&legacy_tx_bytes()).unwrap();
        let segwit = parse_transaction(&segwit_tx_bytes()).unwrap();

        assert!(segwit.segwit);
        assert_eq!(segwit.inputs[0].witness.len(), 2);
        assert_eq!(segwit.inputs[0].witness[0].len(), 72);

        // Witness data is excluded from the identifier.
        assert_eq!(legacy.txid(), segwit.txid());
        assert_eq!(legacy.txid().len(), 64);
    }

    #[test]
    fn test_summary_carries_witness_lens_and_op_return() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&2i32.to_le_bytes());
        raw.push(1);
        build_input(&mut raw, [0x22; 32], 1, &[]);
        raw.push(2);
        build_output(&mut raw, 50_000, &[0x51]);
        build_output(&mut raw, 0, &[0x6a, 0x04, 0xde, 0xad, 0xbe, 0xef]);
        raw.extend_from_slice(&0u32.to_le_bytes());

        let summary = parse_transaction(&raw).unwrap().to_summary();
        assert!(!summary.outputs[0].op_return);
        assert!(summary.outputs[1].op_return);
        assert!(summary.inputs[0].witness_lens.is_empty());
        assert_eq!(summary.outputs[0].value_btc, 0.0005);
    }

    #[test]
    fn test_truncated_and_trailing_fail() {
        assert!(matches!(
            parse_transaction(&[]),
            Err(ParseError::Truncated(_))
        ));

        let mut short = legacy_tx_bytes();
        short.truncate(short.len() - 2);
        assert!(matches!(
            parse_transaction(&short),
            Err(ParseError::Truncated(_))
        ));

        let mut long = legacy_tx_bytes();
        long.extend_from_slice(&[0, 0, 0]);
        assert_eq!(parse_transaction(&long), Err(ParseError::TrailingBytes(3)));
    }

    #[test]
    fn test_impossible_varint_fails() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&2i32.to_le_bytes());
        // Claims 65535 inputs with nothing behind it.
        raw.push(0xfd);
        raw.extend_from_slice(&0xffffu16.to_le_bytes());
        assert!(matches!(
            parse_transaction(&raw),
            Err(ParseError::BadVarint(_))
        ));
    }

    #[test]
    fn test_coinbase_detection() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1i32.to_le_bytes());
        raw.push(1);
        // BIP34 push of height 850,000 = 0x0CF850.
        build_input(&mut raw, [0x00; 32], u32::MAX, &[0x03, 0x50, 0xf8, 0x0c]);
        raw.push(1);
        build_output(&mut raw, 312_500_000, &[0x51]);
        raw.extend_from_slice(&0u32.to_le_bytes());

        let tx = parse_transaction(&raw).unwrap();
        assert!(tx.inputs[0].is_coinbase());
        assert!(tx.to_summary().inputs[0].coinbase);
        assert_eq!(bip34_height(&tx), Some(850_000));
    }

    #[test]
    fn test_parse_block() {
        let mut raw = Vec::new();
        let mut header = [0u8; 80];
        header[HEADER_TIME_OFFSET..HEADER_TIME_OFFSET + 4]
            .copy_from_slice(&1_700_000_123u32.to_le_bytes());
        raw.extend_from_slice(&header);
        raw.push(2); // two transactions

        // Coinbase first.
        raw.extend_from_slice(&1i32.to_le_bytes());
        raw.push(1);
        build_input(&mut raw, [0x00; 32], u32::MAX, &[0x03, 0x50, 0xf8, 0x0c]);
        raw.push(1);
        build_output(&mut raw, 312_500_000, &[0x51]);
        raw.extend_from_slice(&0u32.to_le_bytes());

        raw.extend_from_slice(&legacy_tx_bytes());

        let block = parse_block(&raw).unwrap();
        assert_eq!(block.timestamp, 1_700_000_123);
        assert_eq!(block.height, Some(850_000));
        assert_eq!(block.transactions.len(), 2);
        assert!(!block.transactions[1].inputs[0].is_coinbase());
    }
}
