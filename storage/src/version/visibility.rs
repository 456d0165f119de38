// storage/src/version/visibility.rs

//! Visibility rules for row versions.

use super::{Transaction, VersionHeader};
use crate::transaction::{IsolationLevel, TransactionStatus};
use crate::Result;

/// Whether `txn` may see a version with `header`.
pub fn is_visible<S>(status: &S, txn: &Transaction, header: VersionHeader) -> Result<bool>
where
    S: TransactionStatus + ?Sized,
{
    match txn.level() {
        IsolationLevel::ReadCommitted => read_committed(status, txn, header),
        IsolationLevel::RepeatableRead => repeatable_read(status, txn, header),
    }
}

fn read_committed<S>(status: &S, txn: &Transaction, header: VersionHeader) -> Result<bool>
where
    S: TransactionStatus + ?Sized,
{
    let xid = txn.xid();
    let VersionHeader { xmin, xmax } = header;

    if xmin == xid && xmax == 0 {
        return Ok(true);
    }
    if status.is_committed(xmin)? {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != xid && !status.is_committed(xmax)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn repeatable_read<S>(status: &S, txn: &Transaction, header: VersionHeader) -> Result<bool>
where
    S: TransactionStatus + ?Sized,
{
    let xid = txn.xid();
    let VersionHeader { xmin, xmax } = header;

    if xmin == xid && xmax == 0 {
        return Ok(true);
    }
    // The creator must have committed before we began.
    if status.is_committed(xmin)? && xmin < xid && !txn.in_snapshot(xmin) {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != xid
            && (!status.is_committed(xmax)? || xmax > xid || txn.in_snapshot(xmax))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether the version was deleted by a committed transaction that `txn`
/// cannot order before itself. Only repeatable read checks this; a true
/// result is a concurrent update and `txn` must abort.
pub fn is_version_skip<S>(status: &S, txn: &Transaction, header: VersionHeader) -> Result<bool>
where
    S: TransactionStatus + ?Sized,
{
    if txn.level() == IsolationLevel::ReadCommitted || header.xmax == 0 {
        return Ok(false);
    }
    let xmax = header.xmax;
    Ok(status.is_committed(xmax)? && (xmax > txn.xid() || txn.in_snapshot(xmax)))
}
