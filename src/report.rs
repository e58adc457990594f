use std::fmt::Write;

use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::engine::VenueGaps;
use crate::model::{Branch, TimeRange};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VenueSlots {
    pub venue_id: Ulid,
    pub venue_name: String,
    pub gaps: Vec<TimeRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchSlots {
    pub branch_id: Ulid,
    pub branch_name: String,
    pub venues: Vec<VenueSlots>,
}

/// Free gaps grouped by branch, then venue. Venues without a gap and
/// branches without such a venue are left out entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableSlotsReport {
    pub date: NaiveDate,
    pub window: TimeRange,
    pub branches: Vec<BranchSlots>,
}

impl AvailableSlotsReport {
    pub fn build(date: NaiveDate, window: TimeRange, branches: &[Branch], venues: Vec<VenueGaps>) -> Self {
        let mut grouped: Vec<BranchSlots> = Vec::new();
        for branch in branches {
            let mut slots: Vec<VenueSlots> = venues
                .iter()
                .filter(|v| v.branch_id == branch.id && !v.gaps.is_empty())
                .map(|v| VenueSlots {
                    venue_id: v.venue_id,
                    venue_name: v.venue_name.clone(),
                    gaps: v.gaps.clone(),
                })
                .collect();
            if slots.is_empty() {
                continue;
            }
            slots.sort_by(|a, b| a.venue_name.cmp(&b.venue_name));
            grouped.push(BranchSlots {
                branch_id: branch.id,
                branch_name: branch.name.clone(),
                venues: slots,
            });
        }
        Self { date, window, branches: grouped }
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Plain text ready to paste into a chat.
    pub fn share_text(&self) -> String {
        let mut out = format!(
            "Available slots {} ({})\n",
            self.date.format("%a %d %b %Y"),
            fmt_range(&self.window)
        );
        if self.is_empty() {
            out.push_str("\nFully booked.\n");
            return out;
        }
        for branch in &self.branches {
            let _ = write!(out, "\n{}\n", branch.branch_name);
            for venue in &branch.venues {
                let gaps: Vec<String> = venue.gaps.iter().map(fmt_range).collect();
                let _ = writeln!(out, "  {}: {}", venue.venue_name, gaps.join(", "));
            }
        }
        out
    }
}

fn fmt_range(r: &TimeRange) -> String {
    format!("{}-{}", r.start.format("%H:%M"), r.end.format("%H:%M"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn gaps(branch: &Branch, name: &str, ranges: &[(NaiveTime, NaiveTime)]) -> VenueGaps {
        VenueGaps {
            venue_id: Ulid::new(),
            venue_name: name.into(),
            branch_id: branch.id,
            gaps: ranges.iter().map(|(s, e)| TimeRange::new(*s, *e)).collect(),
        }
    }

    #[test]
    fn empty_venues_and_branches_are_omitted() {
        let north = Branch { id: Ulid::new(), name: "North".into() };
        let south = Branch { id: Ulid::new(), name: "South".into() };
        let venues = vec![
            gaps(&north, "Court 2", &[(t(8, 0), t(10, 0))]),
            gaps(&north, "Court 1", &[(t(18, 0), t(19, 30)), (t(21, 0), t(23, 0))]),
            gaps(&north, "Court 3", &[]),
            gaps(&south, "Court A", &[]),
        ];
        let report = AvailableSlotsReport::build(
            "2024-03-04".parse().unwrap(),
            TimeRange::new(t(8, 0), t(23, 0)),
            &[north.clone(), south],
            venues,
        );
        assert_eq!(report.branches.len(), 1);
        assert_eq!(report.branches[0].branch_id, north.id);
        let names: Vec<&str> = report.branches[0].venues.iter().map(|v| v.venue_name.as_str()).collect();
        assert_eq!(names, vec!["Court 1", "Court 2"]);

        let text = report.share_text();
        assert_eq!(
            text,
            "Available slots Mon 04 Mar 2024 (08:00-23:00)\n\
             \nNorth\n  Court 1: 18:00-19:30, 21:00-23:00\n  Court 2: 08:00-10:00\n"
        );
        assert!(!text.contains("South"));
    }

    #[test]
    fn fully_booked_day_says_so() {
        let report = AvailableSlotsReport::build(
            "2024-03-04".parse().unwrap(),
            TimeRange::new(t(8, 0), t(23, 0)),
            &[],
            Vec::new(),
        );
        assert!(report.is_empty());
        assert!(report.share_text().ends_with("Fully booked.\n"));
    }
}
