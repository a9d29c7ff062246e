use chrono::{Datelike, Days, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::notes::Note;

/// A calendar month, the unit the grid is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthCursor {
    pub year: i32,
    /// 1-based month.
    pub month: u32,
}

impl MonthCursor {
    /// `None` for an invalid month, or for one whose padded grid would leave
    /// the supported date range.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        let cursor = Self { year, month };
        cursor.grid_bounds().map(|_| cursor)
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    pub fn last_day(&self) -> Option<NaiveDate> {
        (28..=31)
            .rev()
            .find_map(|day| NaiveDate::from_ymd_opt(self.year, self.month, day))
    }

    /// First and last date shown in the Sunday-first grid.
    pub fn grid_bounds(&self) -> Option<(NaiveDate, NaiveDate)> {
        let first = self.first_day()?;
        let last = self.last_day()?;
        let leading = first.weekday().num_days_from_sunday() as u64;
        let trailing = 6 - last.weekday().num_days_from_sunday() as u64;
        Some((
            first.checked_sub_days(Days::new(leading))?,
            last.checked_add_days(Days::new(trailing))?,
        ))
    }

    pub fn prev(&self) -> Self {
        if self.month == 1 {
            Self { year: self.year.saturating_sub(1), month: 12 }
        } else {
            Self { year: self.year, month: self.month - 1 }
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year.saturating_add(1), month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayCell {
    pub date: NaiveDate,
    pub in_month: bool,
    pub count: usize,
}

/// Sunday-first grid for `month`, padded to whole weeks with days of the
/// neighbouring months. Only in-month cells carry note counts.
///
/// Returns `None` when the month or its padding falls outside the dates
/// chrono can represent.
pub fn month_grid<Tz: TimeZone>(month: MonthCursor, notes: &[Note], tz: &Tz) -> Option<Vec<DayCell>> {
    let (start, end) = month.grid_bounds()?;

    let mut counts: HashMap<NaiveDate, usize> = HashMap::new();
    for note in notes {
        let day = note.local_date(tz);
        if month.contains(day) {
            *counts.entry(day).or_insert(0) += 1;
        }
    }

    let cells = start
        .iter_days()
        .take_while(|day| *day <= end)
        .map(|date| {
            let in_month = month.contains(date);
            DayCell {
                date,
                in_month,
                count: if in_month { counts.get(&date).copied().unwrap_or(0) } else { 0 },
            }
        })
        .collect();

    Some(cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::demo_notes;
    use chrono::{FixedOffset, Utc};

    fn note_at(id: &str, date: &str) -> Note {
        let mut note = demo_notes(Utc::now()).remove(1);
        note.id = id.to_string();
        note.date = date.parse().unwrap();
        note
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_march_2025_grid_counts_same_day_notes() {
        let notes = vec![
            note_at("a", "2025-03-01T09:00:00Z"),
            note_at("b", "2025-03-01T18:30:00Z"),
            note_at("c", "2025-02-28T12:00:00Z"),
            note_at("d", "2025-04-01T12:00:00Z"),
        ];
        let grid = month_grid(MonthCursor::new(2025, 3).unwrap(), &notes, &Utc).unwrap();

        assert_eq!(grid.len() % 7, 0);
        assert_eq!(grid.len(), 42);

        // March 1st 2025 is a Saturday
        let first = grid.iter().position(|c| c.in_month).unwrap();
        assert_eq!(first, 6);
        assert_eq!(grid[first].date, ymd(2025, 3, 1));
        assert_eq!(grid[first].count, 2);

        let feb = grid.iter().find(|c| c.date == ymd(2025, 2, 28)).unwrap();
        assert!(!feb.in_month);
        assert_eq!(feb.count, 0);

        let apr = grid.iter().find(|c| c.date == ymd(2025, 4, 1)).unwrap();
        assert!(!apr.in_month);
        assert_eq!(apr.count, 0);

        assert_eq!(grid.iter().filter(|c| c.in_month).count(), 31);
        assert_eq!(grid.last().unwrap().date, ymd(2025, 4, 5));
    }

    #[test]
    fn test_month_starting_on_sunday_has_no_leading_padding() {
        // June 1st 2025 is a Sunday
        let grid = month_grid(MonthCursor::new(2025, 6).unwrap(), &[], &Utc).unwrap();
        assert!(grid[0].in_month);
        assert_eq!(grid[0].date, ymd(2025, 6, 1));
        assert_eq!(grid.len(), 35);
    }

    #[test]
    fn test_counts_follow_timezone() {
        let notes = vec![note_at("a", "2025-03-31T20:00:00Z")];
        let plus_eight = FixedOffset::east_opt(8 * 3600).unwrap();

        let march = month_grid(MonthCursor::new(2025, 3).unwrap(), &notes, &plus_eight).unwrap();
        assert!(march.iter().all(|c| c.count == 0));

        let april = month_grid(MonthCursor::new(2025, 4).unwrap(), &notes, &plus_eight).unwrap();
        let cell = april.iter().find(|c| c.date == ymd(2025, 4, 1)).unwrap();
        assert_eq!(cell.count, 1);
    }

    #[test]
    fn test_cursor_navigation() {
        let jan = MonthCursor::new(2025, 1).unwrap();
        assert_eq!(jan.prev(), MonthCursor { year: 2024, month: 12 });
        assert_eq!(jan.prev().next(), jan);
        assert_eq!(MonthCursor::new(2024, 2).unwrap().last_day(), Some(ymd(2024, 2, 29)));
        assert_eq!(MonthCursor::new(2025, 2).unwrap().last_day(), Some(ymd(2025, 2, 28)));
        assert_eq!(MonthCursor::containing(ymd(2025, 7, 19)), MonthCursor { year: 2025, month: 7 });
        assert!(MonthCursor::new(2025, 13).is_none());
    }

    #[test]
    fn test_months_at_the_edge_of_the_date_range() {
        // December 31st of the last representable year is a Monday, so the
        // grid would need days past the end of the range
        let max = NaiveDate::MAX;
        assert_eq!(max.month(), 12);
        assert!(MonthCursor::new(max.year(), 12).is_none());
        assert!(MonthCursor::new(262142, 12).is_none());
        assert!(MonthCursor::new(262143, 1).is_none());

        let november = MonthCursor::new(max.year(), 11).unwrap();
        let grid = month_grid(november, &[], &Utc).unwrap();
        assert_eq!(grid.len() % 7, 0);

        assert_eq!(month_grid(november.next(), &[], &Utc), None);
        assert_eq!(month_grid(MonthCursor { year: i32::MAX, month: 12 }, &[], &Utc), None);
        assert_eq!(MonthCursor { year: i32::MAX, month: 12 }.next().year, i32::MAX);
        assert!(MonthCursor::new(NaiveDate::MIN.year(), 1).is_none());
    }
}
