use chrono::{Datelike, NaiveDate, Weekday};

struct Holiday {
    date: (i32, u32, u32),
    name: &'static str,
    substitute: bool,
}

const KOREAN_HOLIDAYS: &[Holiday] = &[
    Holiday { date: (2025, 12, 25), name: "성탄절", substitute: false },
    Holiday { date: (2026, 1, 1), name: "신정", substitute: false },
    Holiday { date: (2026, 2, 16), name: "설날", substitute: false },
    Holiday { date: (2026, 2, 17), name: "설날", substitute: false },
    Holiday { date: (2026, 2, 18), name: "설날", substitute: false },
    Holiday { date: (2026, 3, 1), name: "삼일절", substitute: false },
    Holiday { date: (2026, 3, 2), name: "삼일절 대체공휴일", substitute: true },
    Holiday { date: (2026, 5, 5), name: "어린이날", substitute: false },
    Holiday { date: (2026, 5, 24), name: "석가탄신일", substitute: false },
    Holiday { date: (2026, 5, 25), name: "대체공휴일", substitute: true },
    Holiday { date: (2026, 6, 3), name: "임시공휴일(전국동시지방선거)", substitute: false },
    Holiday { date: (2026, 6, 6), name: "현충일", substitute: false },
    Holiday { date: (2026, 8, 15), name: "광복절", substitute: false },
    Holiday { date: (2026, 8, 17), name: "대체공휴일", substitute: true },
    Holiday { date: (2026, 9, 24), name: "추석", substitute: false },
    Holiday { date: (2026, 9, 25), name: "추석", substitute: false },
    Holiday { date: (2026, 9, 26), name: "추석", substitute: false },
    Holiday { date: (2026, 10, 3), name: "개천절", substitute: false },
    Holiday { date: (2026, 10, 5), name: "대체공휴일", substitute: true },
    Holiday { date: (2026, 10, 9), name: "한글날", substitute: false },
    Holiday { date: (2026, 12, 25), name: "성탄절", substitute: false },
];

fn find(date: NaiveDate) -> Option<&'static Holiday> {
    let key = (date.year(), date.month(), date.day());
    KOREAN_HOLIDAYS.iter().find(|holiday| holiday.date == key)
}

pub fn holiday_name(date: NaiveDate) -> Option<&'static str> {
    find(date).map(|holiday| holiday.name)
}

pub fn is_substitute_holiday(date: NaiveDate) -> bool {
    find(date).is_some_and(|holiday| holiday.substitute)
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}
