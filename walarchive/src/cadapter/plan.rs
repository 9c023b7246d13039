//! Chunk planning: split an object of known size into multipart upload parts.

use crate::error::{StoreError, StoreResult};

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const TIB: u64 = 1 << 40;

/// Per-provider multipart limits. These are a default policy, not protocol
/// constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderLimits {
    /// Maximum number of parts in one object.
    pub max_parts: u64,
    /// Minimum size of every part but the last.
    pub min_part_size: u64,
    /// Cap on object size, kept below the provider's own ceiling.
    pub max_object_size: u64,
}

impl ProviderLimits {
    /// Block-blob style limits used for GCS-style locations and local storage.
    pub const fn gcs() -> Self {
        Self {
            max_parts: 50_000,
            min_part_size: 64 * KIB,
            max_object_size: TIB,
        }
    }

    pub const fn s3() -> Self {
        Self {
            max_parts: 10_000,
            min_part_size: 5 * MIB,
            max_object_size: TIB,
        }
    }
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self::gcs()
    }
}

/// One part of a [`ChunkPlan`]. Part numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpan {
    pub number: u32,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub part_count: u32,
}

impl ChunkPlan {
    /// Parts in order. Every part is `chunk_size` long except possibly the last.
    pub fn parts(&self) -> impl Iterator<Item = PartSpan> + use<> {
        let plan = *self;
        (0..plan.part_count).map(move |idx| {
            let offset = idx as u64 * plan.chunk_size;
            PartSpan {
                number: idx + 1,
                offset,
                len: plan.chunk_size.min(plan.total_size - offset),
            }
        })
    }
}

/// Plan chunks for an object of `total_size` bytes.
///
/// The chunk size is the provider minimum, grown just enough to fit the
/// object in `max_parts` parts. An empty object is a single empty part.
pub fn plan_chunks(total_size: u64, limits: &ProviderLimits) -> StoreResult<ChunkPlan> {
    if total_size > limits.max_object_size {
        return Err(StoreError::ObjectTooLarge {
            size: total_size,
            limit: limits.max_object_size,
        });
    }
    let chunk_size = limits
        .min_part_size
        .max(total_size.div_ceil(limits.max_parts.max(1)))
        .max(1);
    let part_count = total_size.div_ceil(chunk_size).max(1);
    let part_count = u32::try_from(part_count).map_err(|_| StoreError::ObjectTooLarge {
        size: total_size,
        limit: (u32::MAX as u64).saturating_mul(chunk_size),
    })?;
    Ok(ChunkPlan {
        total_size,
        chunk_size,
        part_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_five_gigabytes() {
        let limits = ProviderLimits {
            max_parts: 50_000,
            min_part_size: 65_536,
            max_object_size: TIB,
        };
        let size = 5_000_000_000u64;
        let plan = plan_chunks(size, &limits).unwrap();
        let parts = plan.part_count as u64;
        assert!(plan.chunk_size >= 65_536);
        assert!(parts <= 50_000);
        assert!((parts - 1) * plan.chunk_size < size);
        assert!(size <= parts * plan.chunk_size);
        assert_eq!(plan.chunk_size, 100_000);
        assert_eq!(plan.part_count, 50_000);
    }

    #[test]
    fn test_small_object_uses_minimum_chunk() {
        let limits = ProviderLimits::s3();
        let plan = plan_chunks(12 * MIB + 3, &limits).unwrap();
        assert_eq!(plan.chunk_size, 5 * MIB);
        assert_eq!(plan.part_count, 3);

        let parts: Vec<_> = plan.parts().collect();
        assert_eq!(parts[0], PartSpan { number: 1, offset: 0, len: 5 * MIB });
        assert_eq!(parts[1].offset, 5 * MIB);
        assert_eq!(parts[2].len, 2 * MIB + 3);
        assert_eq!(parts.iter().map(|p| p.len).sum::<u64>(), 12 * MIB + 3);
    }

    #[test]
    fn test_exact_multiple_has_no_short_tail() {
        let limits = ProviderLimits::gcs();
        let plan = plan_chunks(4 * 64 * KIB, &limits).unwrap();
        assert_eq!(plan.part_count, 4);
        assert!(plan.parts().all(|p| p.len == 64 * KIB));
    }

    #[test]
    fn test_empty_object_is_one_empty_part() {
        let plan = plan_chunks(0, &ProviderLimits::gcs()).unwrap();
        assert_eq!(plan.part_count, 1);
        assert_eq!(
            plan.parts().collect::<Vec<_>>(),
            vec![PartSpan { number: 1, offset: 0, len: 0 }]
        );
    }

    #[test]
    fn test_object_over_policy_cap() {
        let limits = ProviderLimits::gcs();
        let err = plan_chunks(TIB + 1, &limits).unwrap_err();
        assert!(matches!(
            err,
            StoreError::ObjectTooLarge { size, limit } if size == TIB + 1 && limit == TIB
        ));
        assert!(plan_chunks(TIB, &limits).is_ok());
    }
}
