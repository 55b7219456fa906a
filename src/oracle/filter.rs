//! Payment selection rules.
//!
//! Decides which transactions carry usable price information. The rules run
//! in a fixed order and the first failing rule tags the rejection; the
//! chaining rule (6) registers the transaction's identifier *after* the
//! check, whatever the outcome, so later transactions spending it in the
//! same batch are dropped.

use std::collections::HashSet;

/// Maximum input count before a transaction is treated as a consolidation.
const MAX_INPUTS: usize = 5;

/// Maximum bytes for a single witness element, and for all witness bytes of
/// one input.
const MAX_WITNESS_BYTES: usize = 500;

/// Per-output amount bounds in BTC (exclusive).
const MIN_OUTPUT_BTC: f64 = 1e-5;
const MAX_OUTPUT_BTC: f64 = 1e5;

/// Filter-facing view of one transaction, buildable from either a decoded
/// binary transaction or a verbose RPC one.
#[derive(Debug, Clone)]
pub struct TxSummary {
    pub txid: String,
    pub inputs: Vec<InputSummary>,
    pub outputs: Vec<OutputSummary>,
}

#[derive(Debug, Clone)]
pub struct InputSummary {
    /// Spent transaction id in display (byte-reversed) hex.
    pub prev_txid: String,
    pub coinbase: bool,
    /// Byte length of each witness element of this input.
    pub witness_lens: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct OutputSummary {
    pub value_btc: f64,
    pub op_return: bool,
}

/// Outcome of running the rules against one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    /// Accepted; carries the output amounts that survived the range rule.
    Accept { outputs: Vec<f64> },
    Reject { reason: RejectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Inputs,
    Outputs,
    Coinbase,
    OpReturn,
    Witness,
    SameDay,
    Amount,
}

impl RejectReason {
    pub fn tag(&self) -> &'static str {
        match self {
            RejectReason::Inputs => "inputs",
            RejectReason::Outputs => "outputs",
            RejectReason::Coinbase => "coinbase",
            RejectReason::OpReturn => "op_return",
            RejectReason::Witness => "witness",
            RejectReason::SameDay => "same_day",
            RejectReason::Amount => "amount",
        }
    }
}

/// Per-rule rejection counters for one batch or window.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FilterDiagnostics {
    pub total_txs: u64,
    pub filtered_inputs: u64,
    pub filtered_outputs: u64,
    pub filtered_coinbase: u64,
    pub filtered_op_return: u64,
    pub filtered_witness: u64,
    pub filtered_same_day: u64,
    pub filtered_amount: u64,
    pub passed_filter: u64,
}

impl FilterDiagnostics {
    pub fn record(&mut self, outcome: &FilterOutcome) {
        self.total_txs += 1;
        match outcome {
            FilterOutcome::Accept { .. } => self.passed_filter += 1,
            FilterOutcome::Reject { reason } => match reason {
                RejectReason::Inputs => self.filtered_inputs += 1,
                RejectReason::Outputs => self.filtered_outputs += 1,
                RejectReason::Coinbase => self.filtered_coinbase += 1,
                RejectReason::OpReturn => self.filtered_op_return += 1,
                RejectReason::Witness => self.filtered_witness += 1,
                RejectReason::SameDay => self.filtered_same_day += 1,
                RejectReason::Amount => self.filtered_amount += 1,
            },
        }
    }

    pub fn total_filtered(&self) -> u64 {
        self.total_txs - self.passed_filter
    }
}

/// Stateful filter for one batch (a day of blocks) or one rolling window.
///
/// The identifier set backs the chaining rule; for the streaming window it
/// is pruned together with expired transactions.
#[derive(Debug, Default)]
pub struct TxFilter {
    batch_txids: HashSet<String>,
}

impl TxFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the rules to one transaction, updating the identifier set.
    pub fn evaluate(&mut self, tx: &TxSummary) -> FilterOutcome {
        if tx.inputs.len() > MAX_INPUTS {
            return FilterOutcome::Reject {
                reason: RejectReason::Inputs,
            };
        }

        if tx.outputs.len() != 2 {
            return FilterOutcome::Reject {
                reason: RejectReason::Outputs,
            };
        }

        if tx.inputs.iter().any(|input| input.coinbase) {
            return FilterOutcome::Reject {
                reason: RejectReason::Coinbase,
            };
        }

        if tx.outputs.iter().any(|output| output.op_return) {
            return FilterOutcome::Reject {
                reason: RejectReason::OpReturn,
            };
        }

        for input in &tx.inputs {
            let mut total = 0usize;
            for len in &input.witness_lens {
                total += len;
                if *len > MAX_WITNESS_BYTES || total > MAX_WITNESS_BYTES {
                    return FilterOutcome::Reject {
                        reason: RejectReason::Witness,
                    };
                }
            }
        }

        let chained = tx
            .inputs
            .iter()
            .any(|input| self.batch_txids.contains(&input.prev_txid));

        // The identifier joins the set after the chaining check, whether or
        // not this transaction survives.
        self.batch_txids.insert(tx.txid.clone());

        if chained {
            return FilterOutcome::Reject {
                reason: RejectReason::SameDay,
            };
        }

        let outputs: Vec<f64> = tx
            .outputs
            .iter()
            .map(|output| output.value_btc)
            .filter(|value| MIN_OUTPUT_BTC < *value && *value < MAX_OUTPUT_BTC)
            .collect();

        if outputs.is_empty() {
            return FilterOutcome::Reject {
                reason: RejectReason::Amount,
            };
        }

        FilterOutcome::Accept { outputs }
    }

    /// Drop an identifier from the chaining set (window expiry).
    pub fn forget(&mut self, txid: &str) {
        self.batch_txids.remove(txid);
    }

    pub fn tracked_ids(&self) -> usize {
        self.batch_txids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment_tx(txid: &str, inputs: usize, values: &[f64]) -> TxSummary {
        TxSummary {
            txid: txid.to_string(),
            inputs: (0..inputs)
                .map(|i| InputSummary {
                    prev_txid: format!("prev-{}-{}", txid, i),
                    coinbase: false,
                    witness_lens: vec![72, 33],
                })
                .collect(),
            outputs: values
                .iter()
                .map(|v| OutputSummary {
                    value_btc: *v,
                    op_return: false,
                })
                .collect(),
        }
    }

    #[test]
    fn test_rejects_too_many_inputs() {
        let mut filter = TxFilter::new();
        let tx = payment_tx("a", 6, &[0.001, 0.002]);
        assert_eq!(
            filter.evaluate(&tx),
            FilterOutcome::Reject {
                reason: RejectReason::Inputs
            }
        );
        let mut diag = FilterDiagnostics::default();
        diag.record(&FilterOutcome::Reject {
            reason: RejectReason::Inputs,
        });
        assert_eq!(diag.filtered_inputs, 1);
    }

    #[test]
    fn test_rejects_wrong_output_count() {
        let mut filter = TxFilter::new();
        assert_eq!(
            filter.evaluate(&payment_tx("a", 1, &[0.001])),
            FilterOutcome::Reject {
                reason: RejectReason::Outputs
            }
        );
        assert_eq!(
            filter.evaluate(&payment_tx("b", 1, &[0.001, 0.002, 0.003])),
            FilterOutcome::Reject {
                reason: RejectReason::Outputs
            }
        );
    }

    #[test]
    fn test_rejects_coinbase() {
        let mut filter = TxFilter::new();
        let mut tx = payment_tx("a", 1, &[0.001, 0.002]);
        tx.inputs[0].coinbase = true;
        assert_eq!(
            filter.evaluate(&tx),
            FilterOutcome::Reject {
                reason: RejectReason::Coinbase
            }
        );
    }

    #[test]
    fn test_rejects_op_return_output() {
        let mut filter = TxFilter::new();
        let mut tx = payment_tx("a", 1, &[0.001, 0.0]);
        tx.outputs[1].op_return = true;
        assert_eq!(
            filter.evaluate(&tx),
            FilterOutcome::Reject {
                reason: RejectReason::OpReturn
            }
        );
    }

    #[test]
    fn test_rejects_witness_bloat() {
        let mut filter = TxFilter::new();

        let mut tx = payment_tx("a", 1, &[0.001, 0.002]);
        tx.inputs[0].witness_lens = vec![501];
        assert_eq!(
            filter.evaluate(&tx),
            FilterOutcome::Reject {
                reason: RejectReason::Witness
            }
        );

        // Total per input over the cap, even though each item is under it.
        let mut tx = payment_tx("b", 1, &[0.001, 0.002]);
        tx.inputs[0].witness_lens = vec![300, 300];
        assert_eq!(
            filter.evaluate(&tx),
            FilterOutcome::Reject {
                reason: RejectReason::Witness
            }
        );
    }

    #[test]
    fn test_same_day_chaining_adds_after_check() {
        let mut filter = TxFilter::new();

        let first = payment_tx("first", 1, &[0.001, 0.002]);
        assert!(matches!(
            filter.evaluate(&first),
            FilterOutcome::Accept { .. }
        ));

        // Spends an output of "first": chained.
        let mut second = payment_tx("second", 1, &[0.003, 0.004]);
        second.inputs[0].prev_txid = "first".to_string();
        assert_eq!(
            filter.evaluate(&second),
            FilterOutcome::Reject {
                reason: RejectReason::SameDay
            }
        );

        // "second" was registered even though it was rejected, so spending it
        // is also chained.
        let mut third = payment_tx("third", 1, &[0.005, 0.006]);
        third.inputs[0].prev_txid = "second".to_string();
        assert_eq!(
            filter.evaluate(&third),
            FilterOutcome::Reject {
                reason: RejectReason::SameDay
            }
        );

        // A transaction does not chain on itself: the id is added only after
        // its own check.
        let mut selfspend = payment_tx("selfspend", 1, &[0.001, 0.002]);
        selfspend.inputs[0].prev_txid = "selfspend".to_string();
        assert!(matches!(
            filter.evaluate(&selfspend),
            FilterOutcome::Accept { .. }
        ));
    }

    #[test]
    fn test_amount_range_keeps_surviving_outputs() {
        let mut filter = TxFilter::new();

        // One output in range, one below: accept with the survivor only.
        let tx = payment_tx("a", 1, &[0.001, 1e-6]);
        assert_eq!(
            filter.evaluate(&tx),
            FilterOutcome::Accept {
                outputs: vec![0.001]
            }
        );

        // Both outside: reject.
        let tx = payment_tx("b", 1, &[1e-6, 2e5]);
        assert_eq!(
            filter.evaluate(&tx),
            FilterOutcome::Reject {
                reason: RejectReason::Amount
            }
        );

        // Bounds are exclusive.
        let tx = payment_tx("c", 1, &[1e-5, 1e5]);
        assert_eq!(
            filter.evaluate(&tx),
            FilterOutcome::Reject {
                reason: RejectReason::Amount
            }
        );
    }

    #[test]
    fn test_filter_determinism_with_fresh_state() {
        let txs: Vec<TxSummary> = (0..20)
            .map(|i| {
                let mut tx = payment_tx(&format!("tx-{}", i), 1 + i % 4, &[0.001, 0.02]);
                if i % 5 == 0 {
                    tx.inputs[0].prev_txid = format!("tx-{}", i.saturating_sub(1));
                }
                tx
            })
            .collect();

        let run = || {
            let mut filter = TxFilter::new();
            txs.iter().map(|tx| filter.evaluate(tx)).collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_forget_unchains() {
        let mut filter = TxFilter::new();
        filter.evaluate(&payment_tx("old", 1, &[0.001, 0.002]));
        filter.forget("old");

        let mut tx = payment_tx("later", 1, &[0.001, 0.002]);
        tx.inputs[0].prev_txid = "old".to_string();
        assert!(matches!(filter.evaluate(&tx), FilterOutcome::Accept { .. }));
    }
}
