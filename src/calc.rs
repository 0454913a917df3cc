use serde::Serialize;

/// Weights of the three score components in the subject average.
pub const PROCESS_WEIGHT: f64 = 0.4;
pub const MIDTERM_WEIGHT: f64 = 0.3;
pub const FINAL_WEIGHT: f64 = 0.3;

/// Lowest 10-point average that still earns the subject's credits.
pub const PASS_THRESHOLD: f64 = 4.0;

/// 10-point lower bound, 4-point value, letter. Ordered high to low.
const CONVERSION_TABLE: [(f64, f64, &str); 7] = [
    (8.5, 4.0, "A"),
    (8.0, 3.5, "B+"),
    (7.0, 3.0, "B"),
    (6.5, 2.5, "C+"),
    (5.5, 2.0, "C"),
    (5.0, 1.5, "D+"),
    (4.0, 1.0, "D"),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GradePoint {
    pub scale4: f64,
    pub letter: &'static str,
}

/// Two-decimal rounding, matching `ROUND(x, 2)` on the stored column.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn convert_score(score10: f64) -> GradePoint {
    for (min, scale4, letter) in CONVERSION_TABLE {
        if score10 >= min {
            return GradePoint { scale4, letter };
        }
    }
    GradePoint {
        scale4: 0.0,
        letter: "F",
    }
}

pub fn weighted_average(process: f64, midterm: f64, final_score: f64) -> f64 {
    round2(PROCESS_WEIGHT * process + MIDTERM_WEIGHT * midterm + FINAL_WEIGHT * final_score)
}

pub fn is_passing(score10: f64) -> bool {
    score10 >= PASS_THRESHOLD
}

/// One graded subject: its 10-point average and credit count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreditScore {
    pub score10: f64,
    pub credits: i64,
}

pub fn gpa<I>(items: I) -> Option<f64>
where
    I: IntoIterator<Item = CreditScore>,
{
    let mut weighted: f64 = 0.0;
    let mut credits: i64 = 0;
    for item in items {
        if item.credits <= 0 {
            continue;
        }
        weighted += convert_score(item.score10).scale4 * item.credits as f64;
        credits += item.credits;
    }
    if credits == 0 {
        return None;
    }
    Some(round2(weighted / credits as f64))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpaSummary {
    pub gpa: Option<f64>,
    pub total_credits: i64,
    pub earned_credits: i64,
}

pub fn summarize(items: &[CreditScore]) -> GpaSummary {
    let total_credits = items.iter().map(|i| i.credits.max(0)).sum();
    let earned_credits = items
        .iter()
        .filter(|i| is_passing(i.score10))
        .map(|i| i.credits.max(0))
        .sum();
    GpaSummary {
        gpa: gpa(items.iter().copied()),
        total_credits,
        earned_credits,
    }
}

pub fn classify(gpa4: f64) -> &'static str {
    if gpa4 >= 3.6 {
        "excellent"
    } else if gpa4 >= 3.2 {
        "very_good"
    } else if gpa4 >= 2.5 {
        "good"
    } else if gpa4 >= 2.0 {
        "average"
    } else {
        "weak"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreStats {
    pub graded_count: usize,
    pub average: Option<f64>,
    pub highest: Option<f64>,
    pub lowest: Option<f64>,
    pub pass_count: usize,
    pub pass_rate: Option<f64>,
    pub letters: Vec<LetterCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LetterCount {
    pub letter: &'static str,
    pub count: usize,
}

/// Summary over a subject's averages; ungraded students are not counted.
pub fn score_stats(averages: &[f64]) -> ScoreStats {
    if averages.is_empty() {
        return ScoreStats::default();
    }
    let n = averages.len();
    let sum: f64 = averages.iter().sum();
    let highest = averages.iter().copied().fold(f64::MIN, f64::max);
    let lowest = averages.iter().copied().fold(f64::MAX, f64::min);
    let pass_count = averages.iter().filter(|a| is_passing(**a)).count();

    let mut letters: Vec<LetterCount> = CONVERSION_TABLE
        .iter()
        .map(|(_, _, letter)| LetterCount {
            letter: *letter,
            count: 0,
        })
        .collect();
    letters.push(LetterCount {
        letter: "F",
        count: 0,
    });
    for a in averages {
        let letter = convert_score(*a).letter;
        if let Some(slot) = letters.iter_mut().find(|l| l.letter == letter) {
            slot.count += 1;
        }
    }

    ScoreStats {
        graded_count: n,
        average: Some(round2(sum / n as f64)),
        highest: Some(highest),
        lowest: Some(lowest),
        pass_count,
        pass_rate: Some(round2(100.0 * pass_count as f64 / n as f64)),
        letters,
    }
}
