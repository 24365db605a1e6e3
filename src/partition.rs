//! Positional partitioning of a batch into the two dispatch shares.

use std::fmt;
use std::ops::Range;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::errors::Result;
use crate::record::Batch;

/// Which slice of a batch a push carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareKind {
    /// The leading rows, held for the passive unit.
    Minority,
    /// The trailing rows, for the active unit.
    Majority,
    /// Both shares re-joined in original order.
    Combined,
}

impl ShareKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareKind::Minority => "minority",
            ShareKind::Majority => "majority",
            ShareKind::Combined => "combined",
        }
    }
}

impl fmt::Display for ShareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fraction of a batch that goes into the minority share.
///
/// The boundary is `floor(len * fraction)`, so with the default of one
/// third a 100 record batch splits 33/67.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct SplitRatio(f64);

impl SplitRatio {
    pub fn new(minority_fraction: f64) -> Result<Self> {
        if minority_fraction > 0.0 && minority_fraction < 1.0 {
            Ok(Self(minority_fraction))
        } else {
            Err(Error::config(format!(
                "minority fraction must be strictly between 0 and 1, got {minority_fraction}"
            )))
        }
    }

    pub fn minority_fraction(&self) -> f64 {
        self.0
    }

    /// Row index where the majority share starts.
    pub fn boundary(&self, len: usize) -> usize {
        // Exact thirds are the common case; avoid float rounding
        // putting 99 rows at 32.99999.
        if (self.0 - 1.0 / 3.0).abs() < f64::EPSILON {
            len / 3
        } else {
            ((len as f64) * self.0).floor() as usize
        }
    }
}

impl Default for SplitRatio {
    fn default() -> Self {
        Self(1.0 / 3.0)
    }
}

impl TryFrom<f64> for SplitRatio {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SplitRatio> for f64 {
    fn from(ratio: SplitRatio) -> Self {
        ratio.0
    }
}

/// A contiguous slice of a batch assigned to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub kind: ShareKind,
    /// Row positions in the original batch.
    pub rows: Range<usize>,
    pub batch: Batch,
}

impl Share {
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// The immutable result of partitioning one batch.
///
/// Computed once per cycle before any peer thread starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shares {
    pub minority: Share,
    pub majority: Share,
    pub combined: Share,
}

impl Shares {
    pub fn get(&self, kind: ShareKind) -> &Share {
        match kind {
            ShareKind::Minority => &self.minority,
            ShareKind::Majority => &self.majority,
            ShareKind::Combined => &self.combined,
        }
    }
}

/// Split `batch` by row position: the first `ratio.boundary()` rows
/// are the minority share, the rest the majority share.
pub fn partition(batch: &Batch, ratio: SplitRatio) -> Shares {
    let len = batch.len();
    let boundary = ratio.boundary(len);
    let minority = Share {
        kind: ShareKind::Minority,
        rows: 0..boundary,
        batch: batch.slice(0..boundary),
    };
    let majority = Share {
        kind: ShareKind::Majority,
        rows: boundary..len,
        batch: batch.slice(boundary..len),
    };
    let combined = Share {
        kind: ShareKind::Combined,
        rows: 0..len,
        batch: minority.batch.clone().concat(majority.batch.clone()),
    };
    Shares {
        minority,
        majority,
        combined,
    }
}

#[cfg(test)]
fn numbered(n: usize) -> Batch {
    use crate::record::Record;
    Batch::new(
        (0..n)
            .map(|i| Record::from_iter([("row", i.to_string())]))
            .collect(),
    )
}

#[test]
fn hundred_rows_split_33_67() {
    let shares = partition(&numbered(100), SplitRatio::default());
    assert_eq!(shares.minority.len(), 33);
    assert_eq!(shares.majority.len(), 67);
    assert_eq!(shares.combined.len(), 100);
    assert_eq!(shares.minority.rows, 0..33);
    assert_eq!(shares.majority.rows, 33..100);
}

#[test]
fn shares_are_contiguous_disjoint_and_complete() {
    let mut rng = fastrand::Rng::with_seed(7);
    for _ in 0..50 {
        let len = rng.usize(0..300);
        let fraction = rng.f64() * 0.98 + 0.01;
        let batch = numbered(len);
        let shares = partition(&batch, SplitRatio::new(fraction).unwrap());

        assert_eq!(shares.minority.rows.end, shares.majority.rows.start);
        assert_eq!(shares.minority.rows.start, 0);
        assert_eq!(shares.majority.rows.end, len);
        let rejoined = shares.minority.batch.clone().concat(shares.majority.batch.clone());
        assert_eq!(rejoined, batch);
        assert_eq!(shares.combined.batch, batch);
    }
}

#[test]
fn tiny_batches_put_everything_in_majority() {
    let shares = partition(&numbered(2), SplitRatio::default());
    assert!(shares.minority.is_empty());
    assert_eq!(shares.majority.len(), 2);

    let shares = partition(&Batch::default(), SplitRatio::default());
    assert!(shares.combined.is_empty());
}

#[test]
fn split_ratio_rejects_out_of_range() {
    assert!(SplitRatio::new(0.0).is_err());
    assert!(SplitRatio::new(1.0).is_err());
    assert!(SplitRatio::new(f64::NAN).is_err());
    assert!(serde_json::from_str::<SplitRatio>("1.5").is_err());
    let ratio: SplitRatio = serde_json::from_str("0.25").unwrap();
    assert_eq!(ratio.boundary(100), 25);
}

#[test]
fn share_kind_serde_tokens() {
    use serde_test::assert_tokens;
    use serde_test::Token;

    assert_tokens(
        &ShareKind::Combined,
        &[Token::UnitVariant {
            name: "ShareKind",
            variant: "combined",
        }],
    );
}
