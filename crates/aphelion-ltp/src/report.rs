//! Reception report planning.
//!
//! A checkpoint asks the receiver to describe what it holds. The walk
//! below merges stored segments into contiguous claims and splits the
//! answer into several reports when the claims alone would threaten
//! the configured segment size.

use crate::reassembly::SegmentMap;
use crate::sdnv::Sdnv;
use crate::wire::ReportClaim;

/// Bounds and claims for one report, before a serial number and
/// session header are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPlan {
    pub lower_bounds: u64,
    pub upper_bounds: u64,
    pub claims: Vec<ReportClaim>,
}

/// Single-claim plan for a fully received red part.
pub fn plan_full(received: u64) -> ReportPlan {
    ReportPlan {
        lower_bounds: 0,
        upper_bounds: received,
        claims: vec![ReportClaim::new(0, received)],
    }
}

/// Octets the claim costs once encoded relative to `lower`.
fn claim_cost(lower: u64, claim: &ReportClaim) -> usize {
    Sdnv::new(claim.offset - lower).encoded_len() + Sdnv::new(claim.length).encoded_len()
}

/// Walks stored segments from `lower_bounds`, merging contiguous runs
/// into claims. The size estimate starts at half of `segsize` to leave
/// room for headers and trailers; when the claims push it to the
/// budget the report is closed with its upper bounds at the start of
/// the claim that did not fit, and that claim opens the next report.
/// The walk stops once a claim reaches `chkpt_upper_bounds`.
pub fn plan_reports(
    map: &SegmentMap,
    lower_bounds: u64,
    chkpt_upper_bounds: u64,
    segsize: usize,
) -> Vec<ReportPlan> {
    let mut plans = Vec::new();
    let mut claims: Vec<ReportClaim> = Vec::new();
    let mut rpt_lower = lower_bounds;
    let mut est = segsize / 2;
    let mut cur: Option<ReportClaim> = None;

    for seg in map.iter_from(lower_bounds) {
        let start = seg.start_byte();
        let len = seg.payload_len();

        let Some(mut claim) = cur.take() else {
            cur = Some(ReportClaim::new(start, len));
            continue;
        };

        if claim.end() >= chkpt_upper_bounds {
            // the running claim already answers the whole checkpoint
            claims.push(claim);
            plans.push(ReportPlan {
                lower_bounds: rpt_lower,
                upper_bounds: claim.end(),
                claims: std::mem::take(&mut claims),
            });
            return plans;
        }

        if claim.end() == start {
            claim.length += len;
            cur = Some(claim);
            continue;
        }

        // gap: close the running claim
        est += claim_cost(rpt_lower, &claim);
        claims.push(claim);
        if est >= segsize {
            plans.push(ReportPlan {
                lower_bounds: rpt_lower,
                upper_bounds: start,
                claims: std::mem::take(&mut claims),
            });
            rpt_lower = start;
            est = segsize / 2;
        }
        cur = Some(ReportClaim::new(start, len));
    }

    if let Some(claim) = cur {
        claims.push(claim);
        plans.push(ReportPlan {
            lower_bounds: rpt_lower,
            upper_bounds: claim.end(),
            claims,
        });
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{
        Color, DataSegment, ReportSegment, SegmentHeader, SessionId, SERVICE_ID_SINGLE,
    };
    use bytes::{Bytes, BytesMut};
    use proptest::prelude::*;

    fn map_with(spans: &[(u64, usize)]) -> SegmentMap {
        let mut map = SegmentMap::new();
        for &(offset, len) in spans {
            map.insert_unchecked(DataSegment::new(
                SessionId::new(1, 1),
                SERVICE_ID_SINGLE,
                Color::Red,
                offset,
                Bytes::from(vec![0xAB; len]),
            ));
        }
        map
    }

    #[test]
    fn full_reception_is_one_claim() {
        let plan = plan_full(15);
        assert_eq!(plan.lower_bounds, 0);
        assert_eq!(plan.upper_bounds, 15);
        assert_eq!(plan.claims, vec![ReportClaim::new(0, 15)]);
    }

    #[test]
    fn contiguous_segments_merge_into_one_claim() {
        let map = map_with(&[(0, 5), (5, 5), (20, 5)]);
        let plans = plan_reports(&map, 0, 25, 10_000);

        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].lower_bounds, 0);
        assert_eq!(plans[0].upper_bounds, 25);
        assert_eq!(plans[0].claims, vec![ReportClaim::new(0, 10), ReportClaim::new(20, 5)]);
    }

    #[test]
    fn tail_gap_lowers_upper_bounds() {
        let map = map_with(&[(0, 10)]);
        let plans = plan_reports(&map, 0, 25, 10_000);

        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].upper_bounds, 10);
        assert_eq!(plans[0].claims, vec![ReportClaim::new(0, 10)]);
    }

    #[test]
    fn budget_splits_into_chained_reports() {
        // every claim costs two octets; the seed of segsize / 2 = 4
        // reaches the budget of 8 after two closed claims
        let map = map_with(&[(0, 1), (2, 1), (4, 1), (6, 1)]);
        let plans = plan_reports(&map, 0, 8, 8);

        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].lower_bounds, 0);
        assert_eq!(plans[0].upper_bounds, 4);
        assert_eq!(plans[0].claims, vec![ReportClaim::new(0, 1), ReportClaim::new(2, 1)]);

        // reports chain: the next lower bounds equal the prior upper
        assert_eq!(plans[1].lower_bounds, plans[0].upper_bounds);
        assert_eq!(plans[1].upper_bounds, 7);
        assert_eq!(plans[1].claims, vec![ReportClaim::new(4, 1), ReportClaim::new(6, 1)]);
    }

    #[test]
    fn walk_stops_at_checkpoint_upper_bounds() {
        let map = map_with(&[(0, 5), (5, 5), (10, 5)]);
        let plans = plan_reports(&map, 0, 10, 10_000);

        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].upper_bounds, 10);
        assert_eq!(plans[0].claims, vec![ReportClaim::new(0, 10)]);
    }

    #[test]
    fn walk_starts_at_lower_bounds() {
        let map = map_with(&[(0, 5), (10, 5), (20, 5)]);
        let plans = plan_reports(&map, 10, 25, 10_000);

        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].lower_bounds, 10);
        assert_eq!(plans[0].claims, vec![ReportClaim::new(10, 5), ReportClaim::new(20, 5)]);
    }

    #[test]
    fn empty_range_yields_no_plans() {
        let map = map_with(&[(0, 5)]);
        assert!(plan_reports(&map, 100, 200, 10_000).is_empty());
        assert!(plan_reports(&SegmentMap::new(), 0, 100, 10_000).is_empty());
    }

    /// Independent fold of stored spans into contiguous runs.
    fn contiguous_runs(spans: &[(u64, usize)]) -> Vec<ReportClaim> {
        let mut runs: Vec<ReportClaim> = Vec::new();
        for &(offset, len) in spans {
            match runs.last_mut() {
                Some(last) if last.end() == offset => last.length += len as u64,
                _ => runs.push(ReportClaim::new(offset, len as u64)),
            }
        }
        runs
    }

    proptest! {
        #[test]
        fn claims_cover_exactly_the_stored_runs(
            gaps in proptest::collection::vec((1u64..30, 1usize..30), 1..20)
        ) {
            // lay segments left to right with at least one byte between them
            let mut spans = Vec::new();
            let mut at = 0u64;
            for (gap, len) in gaps {
                at += gap;
                spans.push((at, len));
                at += len as u64;
            }
            let map = map_with(&spans);

            let plans = plan_reports(&map, 0, at + 1, 1_000_000);
            let merged: Vec<ReportClaim> =
                plans.iter().flat_map(|p| p.claims.iter().copied()).collect();
            prop_assert_eq!(merged, contiguous_runs(&spans));
        }

        #[test]
        fn planned_reports_encode_within_budget(
            gaps in proptest::collection::vec((1u64..40, 1usize..40), 1..40),
            segsize in 64usize..256,
        ) {
            let mut spans = Vec::new();
            let mut at = 0u64;
            for (gap, len) in gaps {
                at += gap;
                spans.push((at, len));
                at += len as u64;
            }
            let map = map_with(&spans);

            // worst-case header fields: 14-bit serials and real bounds
            for plan in plan_reports(&map, 0, at + 1, segsize) {
                let rs = ReportSegment {
                    header: SegmentHeader::new(SessionId::new(1, 1)),
                    report_serial: 0x3FFF,
                    checkpoint_id: 0x3FFF,
                    upper_bounds: plan.upper_bounds,
                    lower_bounds: plan.lower_bounds,
                    claims: plan.claims,
                };
                let mut buf = BytesMut::new();
                rs.encode(&mut buf);
                prop_assert!(
                    buf.len() <= segsize,
                    "report encodes to {} octets, budget {}",
                    buf.len(),
                    segsize
                );
            }
        }

        #[test]
        fn split_reports_always_chain(
            count in 3usize..40,
            segsize in 16usize..64,
        ) {
            // one-byte segments separated by one-byte gaps
            let spans: Vec<(u64, usize)> = (0..count).map(|i| (i as u64 * 2, 1)).collect();
            let map = map_with(&spans);
            let upper = count as u64 * 2;

            let plans = plan_reports(&map, 0, upper, segsize);
            prop_assert!(!plans.is_empty());
            for pair in plans.windows(2) {
                prop_assert_eq!(pair[1].lower_bounds, pair[0].upper_bounds);
            }
            for plan in &plans {
                prop_assert!(!plan.claims.is_empty());
                for claim in &plan.claims {
                    prop_assert!(claim.offset >= plan.lower_bounds);
                }
            }
        }
    }
}
