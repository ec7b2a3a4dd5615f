use crate::estimate::EstimationError;
use std::ops::Range;

/// Partition of the sample into contiguous cross-fitting folds.
///
/// Fold ids are 0-based. Every observation belongs to exactly one fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldAssignment {
    ranges: Vec<Range<usize>>,
    fold_of: Vec<usize>,
}

impl FoldAssignment {
    /// Splits `n` rows into `k` near-equal contiguous folds in original order.
    /// The first `n % k` folds receive one extra row.
    pub fn contiguous(n: usize, k: usize) -> Result<Self, EstimationError> {
        if k < 1 || k > n {
            return Err(EstimationError::InvalidConfig(format!(
                "fold count k = {k} must lie in [1, {n}]"
            )));
        }
        let base = n / k;
        let extra = n % k;
        let mut ranges = Vec::with_capacity(k);
        let mut fold_of = Vec::with_capacity(n);
        let mut start = 0usize;
        for fold in 0..k {
            let size = base + usize::from(fold < extra);
            ranges.push(start..start + size);
            fold_of.extend(std::iter::repeat_n(fold, size));
            start += size;
        }
        Ok(Self { ranges, fold_of })
    }

    /// A single fold covering every row; used when cross-fitting is disabled.
    pub fn single(n: usize) -> Self {
        Self {
            ranges: vec![0..n],
            fold_of: vec![0; n],
        }
    }

    #[inline]
    pub fn num_folds(&self) -> usize {
        self.ranges.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fold_of.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fold_of.is_empty()
    }

    #[inline]
    pub fn fold_of(&self, row: usize) -> usize {
        self.fold_of[row]
    }

    pub fn members(&self, fold: usize) -> Vec<usize> {
        self.ranges[fold].clone().collect()
    }

    pub fn complement(&self, fold: usize) -> Vec<usize> {
        let held_out = &self.ranges[fold];
        (0..self.len()).filter(|i| !held_out.contains(i)).collect()
    }
}
