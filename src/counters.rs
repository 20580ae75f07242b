//! Performance counters: count how many times we do various important
//! operations. Diagnostic only, never load-bearing.

use std::sync::atomic::{fence, AtomicUsize, Ordering};

use enum_map::{Enum, EnumMap};
use lazy_static::lazy_static;
use tracing::debug;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    IndexLoad,
    BackupCacheHit,
    BackupCacheMiss,
    BackupCacheEviction,
}

lazy_static! {
    static ref COUNTER_MAP: EnumMap<Op, AtomicUsize> = EnumMap::default();
}

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

pub fn count(of: Op) -> usize {
    COUNTER_MAP[of].load(Ordering::Relaxed)
}

pub fn log_counts() {
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0)
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::IndexLoad => "indexes loaded",
        Op::BackupCacheHit => "backup cache hits",
        Op::BackupCacheMiss => "backup cache misses",
        Op::BackupCacheEviction => "backup cache evictions",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bump_increments() {
        let before = count(Op::IndexLoad);
        bump(Op::IndexLoad);
        assert_eq!(count(Op::IndexLoad), before + 1);
    }
}
