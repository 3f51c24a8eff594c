//! Deterministic coin selection over funding UTXOs
//!
//! Smallest-first greedy selection: reproducible and simple to audit, not
//! UTXO-count-optimal in general. Selection is re-run after every fee
//! re-estimate inside a contract build, since the fee depends on the input
//! count and the input count depends on the selection.

use log::debug;

use crate::ledger::{sum_funds, FundingUtxo};

/// Select funding UTXOs covering `target` satoshis.
///
/// - Outputs listed in `exclude` (as `(txid, nout)`) are never selected.
/// - Locked outputs are never selected; queued (unconfirmed change) outputs
///   are only considered when `use_in_queue` is set.
/// - If the remaining total is below the target, the result is empty and the
///   caller treats it as insufficient funds.
/// - A single UTXO covering the target wins over any combination; the
///   smallest such UTXO is chosen to minimize the input count.
/// - Otherwise UTXOs accumulate in ascending amount order until the running
///   sum reaches the target. The accumulation intentionally returns at the
///   first sum that covers the target without checking global optimality.
pub fn select(
    target: u64,
    utxos: &[FundingUtxo],
    exclude: &[(String, u32)],
    use_in_queue: bool,
) -> Vec<FundingUtxo> {
    let mut candidates: Vec<&FundingUtxo> = utxos
        .iter()
        .filter(|u| !u.is_locked)
        .filter(|u| !u.in_queue || use_in_queue)
        .filter(|u| {
            !exclude
                .iter()
                .any(|(txid, nout)| *txid == u.txid && *nout == u.nout)
        })
        .collect();

    let total: u64 = candidates.iter().map(|u| u.amount).sum();
    if total < target || candidates.is_empty() {
        debug!("coin selection failed: {total} sat available, {target} sat required");
        return Vec::new();
    }

    candidates.sort_by_key(|u| u.amount);

    // Prefer the smallest single UTXO that covers the target on its own
    if let Some(single) = candidates.iter().find(|u| u.amount >= target) {
        return vec![(*single).clone()];
    }

    let mut selected = Vec::new();
    let mut sum = 0u64;
    for utxo in candidates {
        sum += utxo.amount;
        selected.push(utxo.clone());
        if sum >= target {
            break;
        }
    }
    debug_assert!(sum_funds(&selected) >= target);
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(txid: &str, nout: u32, amount: u64) -> FundingUtxo {
        FundingUtxo {
            txid: txid.to_string(),
            nout,
            amount,
            address: format!("tb1p-{txid}"),
            derivation_path: String::new(),
            is_locked: false,
            in_queue: false,
            key: None,
        }
    }

    #[test]
    fn test_smallest_sufficient_single_wins() {
        let utxos = vec![
            utxo("a", 0, 500),
            utxo("b", 0, 7_000),
            utxo("c", 0, 5_000),
            utxo("d", 0, 90_000),
        ];
        let selected = select(4_000, &utxos, &[], false);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].txid, "c");
    }

    #[test]
    fn test_ascending_prefix_accumulation() {
        let utxos = vec![utxo("a", 0, 300), utxo("b", 0, 100), utxo("c", 0, 200)];
        let selected = select(550, &utxos, &[], false);
        let picked: Vec<&str> = selected.iter().map(|u| u.txid.as_str()).collect();
        assert_eq!(picked, vec!["b", "c", "a"]);
        assert_eq!(sum_funds(&selected), 600);
        // Dropping the final (largest) element leaves the prefix short
        assert!(sum_funds(&selected[..selected.len() - 1]) < 550);
    }

    #[test]
    fn test_insufficient_total_returns_empty() {
        let utxos = vec![utxo("a", 0, 100), utxo("b", 0, 200)];
        assert!(select(1_000, &utxos, &[], false).is_empty());
        assert!(select(1, &[], &[], false).is_empty());
    }

    #[test]
    fn test_excluded_outputs_never_selected() {
        let utxos = vec![utxo("a", 0, 10_000), utxo("b", 1, 400), utxo("c", 2, 700)];
        let exclude = vec![("a".to_string(), 0u32)];
        let selected = select(1_000, &utxos, &exclude, false);
        assert!(selected.iter().all(|u| u.txid != "a"));
        assert!(sum_funds(&selected) >= 1_000);

        // Excluding enough outputs makes the selection insufficient
        let exclude_all = vec![
            ("a".to_string(), 0u32),
            ("b".to_string(), 1u32),
            ("c".to_string(), 2u32),
        ];
        assert!(select(100, &utxos, &exclude_all, false).is_empty());
    }

    #[test]
    fn test_locked_and_queued_filtering() {
        let mut locked = utxo("a", 0, 10_000);
        locked.is_locked = true;
        let mut queued = utxo("b", 0, 10_000);
        queued.in_queue = true;

        let utxos = vec![locked, queued];
        assert!(select(5_000, &utxos, &[], false).is_empty());

        let selected = select(5_000, &utxos, &[], true);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].txid, "b");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let utxos = vec![
            utxo("a", 0, 2_500),
            utxo("b", 0, 2_500),
            utxo("c", 0, 2_500),
        ];
        let first = select(5_000, &utxos, &[], false);
        let second = select(5_000, &utxos, &[], false);
        let ids = |list: &[FundingUtxo]| {
            list.iter()
                .map(|u| (u.txid.clone(), u.nout))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
    }
}
