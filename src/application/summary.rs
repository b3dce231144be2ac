use crate::domain::models::{Participant, VoteKind};
use crate::domain::vote_set::VoteSet;
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A run of consecutive calendar days.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for DateSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (start, end) = (self.start, self.end);
        if start == end {
            write!(f, "{}월 {}일", start.month(), start.day())
        } else if start.year() != end.year() {
            write!(
                f,
                "{}년 {}월 {}일~{}년 {}월 {}일",
                start.year(),
                start.month(),
                start.day(),
                end.year(),
                end.month(),
                end.day()
            )
        } else if start.month() != end.month() {
            write!(
                f,
                "{}월 {}일~{}월 {}일",
                start.month(),
                start.day(),
                end.month(),
                end.day()
            )
        } else {
            write!(f, "{}월 {}~{}일", start.month(), start.day(), end.day())
        }
    }
}

/// Sorts and deduplicates `dates`, then splits them into maximal runs of
/// calendar-successive days.
pub fn group_consecutive(dates: impl IntoIterator<Item = NaiveDate>) -> Vec<DateSpan> {
    let sorted: BTreeSet<NaiveDate> = dates.into_iter().collect();
    let mut spans: Vec<DateSpan> = Vec::new();
    for date in sorted {
        match spans.last_mut() {
            Some(span) if span.end.succ_opt() == Some(date) => span.end = date,
            _ => spans.push(DateSpan::single(date)),
        }
    }
    spans
}

pub fn summarize(dates: impl IntoIterator<Item = NaiveDate>) -> Vec<String> {
    group_consecutive(dates)
        .iter()
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BestDates {
    pub max_votes: usize,
    pub dates: Vec<NaiveDate>,
    pub spans: Vec<DateSpan>,
    pub labels: Vec<String>,
    /// Who is available on at least one best date, in join order.
    pub participants: Vec<Participant>,
    pub first: NaiveDate,
    pub last: NaiveDate,
}

/// Dates with the most available votes. `None` until someone is available.
pub fn best_dates(votes: &VoteSet, participants: &[Participant]) -> Option<BestDates> {
    let counts: BTreeMap<NaiveDate, usize> = votes
        .dates()
        .map(|(date, users)| {
            let available = users
                .values()
                .filter(|kind| **kind == VoteKind::Available)
                .count();
            (date, available)
        })
        .collect();
    let max_votes = counts.values().copied().max().unwrap_or(0);
    if max_votes == 0 {
        return None;
    }

    let dates: Vec<NaiveDate> = counts
        .iter()
        .filter(|(_, count)| **count == max_votes)
        .map(|(date, _)| *date)
        .collect();
    let first = *dates.first()?;
    let last = *dates.last()?;

    let available_users: BTreeSet<&str> = dates
        .iter()
        .flat_map(|date| votes.votes_on(*date))
        .filter(|(_, kind)| *kind == VoteKind::Available)
        .map(|(user, _)| user)
        .collect();
    let participants = participants
        .iter()
        .filter(|participant| available_users.contains(participant.id.as_str()))
        .cloned()
        .collect();

    let spans = group_consecutive(dates.iter().copied());
    let labels = spans.iter().map(ToString::to_string).collect();
    Some(BestDates {
        max_votes,
        dates,
        spans,
        labels,
        participants,
        first,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Vote;

    fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    #[test]
    fn formats_single_days_and_ranges() {
        assert_eq!(summarize([ymd(2025, 7, 3)]), vec!["7월 3일"]);
        assert_eq!(summarize([ymd(2025, 7, 3), ymd(2025, 7, 2)]), vec!["7월 2~3일"]);
        assert_eq!(
            summarize([ymd(2025, 7, 31), ymd(2025, 8, 1), ymd(2025, 8, 2)]),
            vec!["7월 31일~8월 2일"]
        );
        assert_eq!(
            summarize([ymd(2025, 12, 31), ymd(2026, 1, 1), ymd(2026, 1, 2)]),
            vec!["2025년 12월 31일~2026년 1월 2일"]
        );
    }

    #[test]
    fn gaps_split_runs() {
        let spans = group_consecutive([ymd(2025, 7, 1), ymd(2025, 7, 2), ymd(2025, 7, 4), ymd(2025, 7, 4)]);
        assert_eq!(
            spans,
            vec![
                DateSpan { start: ymd(2025, 7, 1), end: ymd(2025, 7, 2) },
                DateSpan::single(ymd(2025, 7, 4)),
            ]
        );
        assert_eq!(spans[0].len_days(), 2);
    }

    #[test]
    fn leap_day_is_consecutive() {
        assert_eq!(
            summarize([ymd(2028, 2, 28), ymd(2028, 2, 29), ymd(2028, 3, 1)]),
            vec!["2월 28일~3월 1일"]
        );
    }

    #[test]
    fn best_dates_pick_single_top_day() {
        let votes = VoteSet::from_votes([
            Vote::new(ymd(2025, 7, 1), "a", VoteKind::Available),
            Vote::new(ymd(2025, 7, 2), "a", VoteKind::Available),
            Vote::new(ymd(2025, 7, 3), "a", VoteKind::Available),
            Vote::new(ymd(2025, 7, 2), "b", VoteKind::Available),
            Vote::new(ymd(2025, 7, 3), "b", VoteKind::Available),
            Vote::new(ymd(2025, 7, 3), "c", VoteKind::Available),
        ]);
        let participants = vec![
            Participant::new("a", "민지"),
            Participant::new("b", "지훈"),
            Participant::new("c", "서연"),
        ];

        let best = best_dates(&votes, &participants).expect("best dates");
        assert_eq!(best.max_votes, 3);
        assert_eq!(best.labels, vec!["7월 3일"]);
        assert_eq!(best.participants.len(), 3);
        assert_eq!(best.first, ymd(2025, 7, 3));
        assert_eq!(best.last, ymd(2025, 7, 3));
    }

    #[test]
    fn tied_dates_report_overall_window() {
        let votes = VoteSet::from_votes([
            Vote::new(ymd(2025, 7, 1), "a", VoteKind::Available),
            Vote::new(ymd(2025, 7, 5), "b", VoteKind::Available),
            Vote::new(ymd(2025, 7, 6), "b", VoteKind::Available),
            Vote::new(ymd(2025, 7, 6), "c", VoteKind::Unavailable),
        ]);
        let participants = vec![
            Participant::new("c", "서연"),
            Participant::new("b", "지훈"),
            Participant::new("a", "민지"),
        ];

        let best = best_dates(&votes, &participants).expect("best dates");
        assert_eq!(best.labels, vec!["7월 1일", "7월 5~6일"]);
        assert_eq!(best.first, ymd(2025, 7, 1));
        assert_eq!(best.last, ymd(2025, 7, 6));
        let names: Vec<_> = best.participants.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn no_available_votes_means_no_best_dates() {
        let votes = VoteSet::from_votes([Vote::new(ymd(2025, 7, 1), "a", VoteKind::Unavailable)]);
        assert!(best_dates(&votes, &[]).is_none());
    }
}
