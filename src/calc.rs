use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Reserved id of the transient what-if assignment. Never written to the store.
pub const WHAT_IF_ID: &str = "__what_if__";

/// Rendered in place of a percentage when there is nothing to average.
pub const NO_GRADE: &str = "—";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown assignment status: {0}")]
    UnknownStatus(String),
    #[error("weight must be between 0 and 100, got {0}")]
    WeightOutOfRange(f64),
    #[error("{field} must be a finite number")]
    NonFinite { field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Planned,
    Submitted,
    Graded,
    Missing,
}

impl AssignmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Planned => "planned",
            AssignmentStatus::Submitted => "submitted",
            AssignmentStatus::Graded => "graded",
            AssignmentStatus::Missing => "missing",
        }
    }
}

impl FromStr for AssignmentStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planned" => Ok(AssignmentStatus::Planned),
            "submitted" => Ok(AssignmentStatus::Submitted),
            "graded" => Ok(AssignmentStatus::Graded),
            "missing" => Ok(AssignmentStatus::Missing),
            _ => Err(ValidationError::UnknownStatus(s.to_string())),
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    pub weight: f64,
    pub drop_lowest: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub category_id: String,
    pub title: String,
    pub points_earned: Option<f64>,
    pub points_possible: Option<f64>,
    pub status: AssignmentStatus,
}

impl Assignment {
    /// Earned/possible as a fraction, or `None` when the assignment is not
    /// scored (a missing side, non-finite input or ratio, or `possible <= 0`).
    pub fn fraction(&self) -> Option<f64> {
        let (earned, possible) = self.scored_points()?;
        Some(earned / possible)
    }

    fn scored_points(&self) -> Option<(f64, f64)> {
        let earned = self.points_earned?;
        let possible = self.points_possible?;
        if !earned.is_finite() || !possible.is_finite() || possible <= 0.0 {
            return None;
        }
        if !(earned / possible).is_finite() {
            return None;
        }
        Some((earned, possible))
    }

    pub fn is_what_if(&self) -> bool {
        is_what_if_id(&self.id)
    }
}

pub fn validate_weight(weight: f64) -> Result<f64, ValidationError> {
    if !weight.is_finite() {
        return Err(ValidationError::NonFinite { field: "weight" });
    }
    if !(0.0..=100.0).contains(&weight) {
        return Err(ValidationError::WeightOutOfRange(weight));
    }
    Ok(weight)
}

/// Negative counts mean "drop nothing".
pub fn clamp_drop_lowest(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

pub fn validate_points(
    field: &'static str,
    value: Option<f64>,
) -> Result<Option<f64>, ValidationError> {
    match value {
        Some(v) if !v.is_finite() => Err(ValidationError::NonFinite { field }),
        other => Ok(other),
    }
}

/// Status stored for a new assignment: anything without both point fields is
/// still planned; otherwise the requested status, graded by default.
pub fn resolve_status(
    requested: Option<AssignmentStatus>,
    points_earned: Option<f64>,
    points_possible: Option<f64>,
) -> AssignmentStatus {
    if points_earned.is_none() || points_possible.is_none() {
        return AssignmentStatus::Planned;
    }
    requested.unwrap_or(AssignmentStatus::Graded)
}

/// Status stored after an update. An explicit status is kept as given.
/// Otherwise a planned row that gains both scores becomes graded, and a
/// graded row that loses one goes back to planned.
pub fn resolve_updated_status(
    requested: Option<AssignmentStatus>,
    current: AssignmentStatus,
    points_earned: Option<f64>,
    points_possible: Option<f64>,
) -> AssignmentStatus {
    if let Some(status) = requested {
        return status;
    }
    let scored = points_earned.is_some() && points_possible.is_some();
    match current {
        AssignmentStatus::Planned if scored => AssignmentStatus::Graded,
        AssignmentStatus::Graded if !scored => AssignmentStatus::Planned,
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedGrade {
    pub overall_pct: f64,
    pub by_category: BTreeMap<String, Option<f64>>,
}

/// Weighted category model.
///
/// Each category averages the fractional scores of its scored assignments
/// after dropping the `drop_lowest` lowest (never all of them), and adds
/// `average * weight / 100` to the overall fraction. Categories without a
/// scored assignment map to `None` and add nothing. Weights are not
/// normalized, so the overall fraction can fall short of or exceed 1.0.
pub fn compute_weighted_grade(
    categories: &[Category],
    assignments: &[Assignment],
) -> WeightedGrade {
    let mut by_category: BTreeMap<String, Option<f64>> = BTreeMap::new();
    let mut overall_pct = 0.0_f64;

    for c in categories {
        let mut fractions: Vec<f64> = assignments
            .iter()
            .filter(|a| a.category_id == c.id)
            .filter_map(Assignment::fraction)
            .collect();

        if fractions.is_empty() {
            by_category.insert(c.id.clone(), None);
            continue;
        }

        fractions.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let drop = (c.drop_lowest as usize).min(fractions.len() - 1);
        let kept = &fractions[drop..];
        let avg = kept.iter().sum::<f64>() / (kept.len() as f64);

        by_category.insert(c.id.clone(), Some(avg));
        overall_pct += avg * (c.weight / 100.0);
    }

    WeightedGrade {
        overall_pct,
        by_category,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointTotals {
    pub earned: f64,
    pub possible: f64,
}

impl PointTotals {
    fn add(&mut self, earned: f64, possible: f64) {
        self.earned += earned;
        self.possible += possible;
    }

    pub fn ratio(&self) -> Option<f64> {
        if self.possible > 0.0 {
            Some(self.earned / self.possible)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseStats {
    pub overall_weighted: f64,
    /// Zero, not `None`, when nothing is scored.
    pub overall_unweighted: f64,
    pub category_weighted: BTreeMap<String, Option<f64>>,
    pub category_unweighted: BTreeMap<String, Option<f64>>,
    pub category_points: BTreeMap<String, PointTotals>,
    pub category_contribution: BTreeMap<String, Option<f64>>,
    pub totals: PointTotals,
}

pub fn compute_course_stats(categories: &[Category], assignments: &[Assignment]) -> CourseStats {
    let weighted = compute_weighted_grade(categories, assignments);
    let unweighted = unweighted_points(categories, assignments);
    assemble_stats(categories, weighted, unweighted)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatIf {
    pub category_id: String,
    pub points_earned: f64,
    pub points_possible: f64,
}

impl WhatIf {
    /// The synthetic assignment, or `None` when the inputs would not be scored.
    pub fn to_assignment(&self) -> Option<Assignment> {
        if self.category_id.trim().is_empty() {
            return None;
        }
        let a = Assignment {
            id: WHAT_IF_ID.to_string(),
            category_id: self.category_id.clone(),
            title: "WHAT-IF".to_string(),
            points_earned: Some(self.points_earned),
            points_possible: Some(self.points_possible),
            status: AssignmentStatus::Graded,
        };
        a.fraction().map(|_| a)
    }
}

pub fn with_what_if(assignments: &[Assignment], what_if: Option<&WhatIf>) -> Vec<Assignment> {
    let mut out: Vec<Assignment> = assignments
        .iter()
        .filter(|a| !a.is_what_if())
        .cloned()
        .collect();
    if let Some(virtual_assignment) = what_if.and_then(WhatIf::to_assignment) {
        out.push(virtual_assignment);
    }
    out
}

/// Course stats with a what-if applied to the weighted figures only; the
/// unweighted figures always describe the real assignments.
pub fn project_course_stats(
    categories: &[Category],
    assignments: &[Assignment],
    what_if: Option<&WhatIf>,
) -> CourseStats {
    let real: Vec<Assignment> = with_what_if(assignments, None);
    let projected = with_what_if(assignments, what_if);
    let weighted = compute_weighted_grade(categories, &projected);
    let unweighted = unweighted_points(categories, &real);
    assemble_stats(categories, weighted, unweighted)
}

pub fn is_what_if_id(id: &str) -> bool {
    id == WHAT_IF_ID
}

/// Drops the what-if sentinel from a list of ids bound for the store.
pub fn without_what_if<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ids.into_iter()
        .map(Into::into)
        .filter(|id| !is_what_if_id(id))
        .collect()
}

pub fn format_pct(x: Option<f64>, digits: usize) -> String {
    let Some(x) = x else {
        return NO_GRADE.to_string();
    };
    // Half-up, like `Int(10*x + 0.5) / 10`; the nudge absorbs binary error on exact halves.
    let factor = 10_f64.powi(digits.min(12) as i32);
    let rounded = ((x * 100.0 * factor) + 0.5 + 1e-9).floor() / factor;
    format!("{:.*}%", digits, rounded)
}

struct UnweightedPoints {
    per_category: BTreeMap<String, PointTotals>,
    totals: PointTotals,
}

fn unweighted_points(categories: &[Category], assignments: &[Assignment]) -> UnweightedPoints {
    let ids: BTreeSet<&str> = categories.iter().map(|c| c.id.as_str()).collect();
    let mut per_category: BTreeMap<String, PointTotals> = categories
        .iter()
        .map(|c| (c.id.clone(), PointTotals::default()))
        .collect();
    let mut totals = PointTotals::default();

    for a in assignments {
        if !ids.contains(a.category_id.as_str()) {
            continue;
        }
        let Some((earned, possible)) = a.scored_points() else {
            continue;
        };
        if let Some(entry) = per_category.get_mut(&a.category_id) {
            entry.add(earned, possible);
        }
        totals.add(earned, possible);
    }

    UnweightedPoints {
        per_category,
        totals,
    }
}

fn assemble_stats(
    categories: &[Category],
    weighted: WeightedGrade,
    unweighted: UnweightedPoints,
) -> CourseStats {
    let mut category_contribution: BTreeMap<String, Option<f64>> = BTreeMap::new();
    for c in categories {
        let avg = weighted.by_category.get(&c.id).copied().flatten();
        category_contribution.insert(c.id.clone(), avg.map(|v| v * (c.weight / 100.0)));
    }

    let category_unweighted = unweighted
        .per_category
        .iter()
        .map(|(id, pts)| (id.clone(), pts.ratio()))
        .collect();

    CourseStats {
        overall_weighted: weighted.overall_pct,
        overall_unweighted: unweighted.totals.ratio().unwrap_or(0.0),
        category_weighted: weighted.by_category,
        category_unweighted,
        category_points: unweighted.per_category,
        category_contribution,
        totals: unweighted.totals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn cat(id: &str, weight: f64, drop_lowest: u32) -> Category {
        Category {
            id: id.to_string(),
            name: id.to_uppercase(),
            weight,
            drop_lowest,
        }
    }

    fn scored(id: &str, category_id: &str, earned: f64, possible: f64) -> Assignment {
        Assignment {
            id: id.to_string(),
            category_id: category_id.to_string(),
            title: id.to_string(),
            points_earned: Some(earned),
            points_possible: Some(possible),
            status: AssignmentStatus::Graded,
        }
    }

    #[test]
    fn no_categories_is_zero_not_ungraded() {
        let grade = compute_weighted_grade(&[], &[scored("a1", "x", 5.0, 10.0)]);
        assert_eq!(grade.overall_pct, 0.0);
        assert!(grade.by_category.is_empty());
    }

    #[test]
    fn empty_category_maps_to_none() {
        let grade = compute_weighted_grade(&[cat("hw", 50.0, 0)], &[]);
        assert_eq!(grade.by_category.get("hw"), Some(&None));
        assert_eq!(grade.overall_pct, 0.0);
    }

    #[test]
    fn drop_lowest_never_drops_everything() {
        let assignments = vec![
            scored("a1", "q", 5.0, 10.0),
            scored("a2", "q", 9.0, 10.0),
            scored("a3", "q", 7.0, 10.0),
        ];
        let grade = compute_weighted_grade(&[cat("q", 100.0, 10)], &assignments);
        let avg = grade.by_category["q"].expect("average");
        assert!((avg - 0.9).abs() < EPS);
        assert!((grade.overall_pct - 0.9).abs() < EPS);
    }

    #[test]
    fn drop_lowest_removes_only_the_lowest() {
        let assignments = vec![
            scored("a1", "q", 2.0, 10.0),
            scored("a2", "q", 8.0, 10.0),
            scored("a3", "q", 6.0, 10.0),
        ];
        let grade = compute_weighted_grade(&[cat("q", 100.0, 1)], &assignments);
        assert!((grade.by_category["q"].expect("average") - 0.7).abs() < EPS);
    }

    #[test]
    fn weighted_sum_of_category_averages() {
        let categories = vec![cat("a", 40.0, 0), cat("b", 60.0, 0)];
        let assignments = vec![
            scored("a1", "a", 85.0, 100.0),
            scored("a2", "a", 95.0, 100.0),
            scored("b1", "b", 16.0, 20.0),
        ];
        let grade = compute_weighted_grade(&categories, &assignments);
        assert!((grade.overall_pct - 0.84).abs() < EPS);
    }

    #[test]
    fn zero_weight_category_contributes_nothing() {
        let categories = vec![cat("a", 100.0, 0), cat("extra", 0.0, 0)];
        let assignments = vec![scored("a1", "a", 1.0, 2.0), scored("e1", "extra", 2.0, 2.0)];
        let grade = compute_weighted_grade(&categories, &assignments);
        assert!((grade.overall_pct - 0.5).abs() < EPS);
        assert_eq!(grade.by_category["extra"], Some(1.0));
    }

    #[test]
    fn overflowing_ratio_is_unscored() {
        let categories = vec![cat("a", 100.0, 0), cat("z", 0.0, 0)];
        let assignments = vec![scored("a1", "a", 9.0, 10.0), scored("z1", "z", 1e308, 1e-10)];
        let grade = compute_weighted_grade(&categories, &assignments);
        assert!(grade.overall_pct.is_finite());
        assert!((grade.overall_pct - 0.9).abs() < EPS);
        assert_eq!(grade.by_category["z"], None);
        assert_eq!(format_pct(Some(grade.overall_pct), 1), "90.0%");

        let totals = unweighted_points(&categories, &assignments).totals;
        assert!((totals.earned - 9.0).abs() < EPS);
        assert!((totals.possible - 10.0).abs() < EPS);
    }

    #[test]
    fn unscored_assignments_are_ignored_not_zeroed() {
        let mut no_possible = scored("a2", "q", 0.0, 0.0);
        no_possible.points_possible = Some(0.0);
        let mut no_earned = scored("a3", "q", 0.0, 10.0);
        no_earned.points_earned = None;
        let mut nan_earned = scored("a4", "q", 0.0, 10.0);
        nan_earned.points_earned = Some(f64::NAN);

        let baseline = compute_weighted_grade(&[cat("q", 100.0, 0)], &[scored("a1", "q", 8.0, 10.0)]);
        let noisy = compute_weighted_grade(
            &[cat("q", 100.0, 0)],
            &[scored("a1", "q", 8.0, 10.0), no_possible, no_earned, nan_earned],
        );
        assert_eq!(baseline, noisy);
    }

    #[test]
    fn status_does_not_filter_scores() {
        let mut missing = scored("a1", "q", 3.0, 10.0);
        missing.status = AssignmentStatus::Missing;
        let mut planned = scored("a2", "q", 5.0, 10.0);
        planned.status = AssignmentStatus::Planned;
        let grade = compute_weighted_grade(&[cat("q", 100.0, 0)], &[missing, planned]);
        assert!((grade.overall_pct - 0.4).abs() < EPS);
    }

    #[test]
    fn assignments_without_a_category_are_excluded() {
        let grade = compute_weighted_grade(
            &[cat("q", 100.0, 0)],
            &[scored("a1", "q", 10.0, 10.0), scored("a2", "gone", 0.0, 10.0)],
        );
        assert!((grade.overall_pct - 1.0).abs() < EPS);
        let stats = compute_course_stats(&[cat("q", 100.0, 0)], &[scored("a2", "gone", 0.0, 10.0)]);
        assert_eq!(stats.totals, PointTotals::default());
    }

    #[test]
    fn unweighted_ratio_is_global_not_averaged() {
        let categories = vec![cat("a", 50.0, 0), cat("b", 50.0, 0), cat("c", 0.0, 0)];
        let assignments = vec![
            scored("a1", "a", 1.0, 2.0),
            scored("b1", "b", 90.0, 100.0),
        ];
        let stats = compute_course_stats(&categories, &assignments);
        assert!((stats.overall_unweighted - 91.0 / 102.0).abs() < EPS);
        assert_eq!(stats.totals, PointTotals { earned: 91.0, possible: 102.0 });
        assert_eq!(stats.category_unweighted["a"], Some(0.5));
        assert_eq!(stats.category_unweighted["c"], None);
        assert_eq!(stats.category_points["c"], PointTotals::default());
        assert_eq!(stats.category_weighted, compute_weighted_grade(&categories, &assignments).by_category);
        assert!((stats.category_contribution["b"].expect("contribution") - 0.45).abs() < EPS);
        assert_eq!(stats.category_contribution["c"], None);
    }

    #[test]
    fn unweighted_is_zero_when_nothing_possible() {
        let stats = compute_course_stats(&[cat("a", 100.0, 0)], &[]);
        assert_eq!(stats.overall_unweighted, 0.0);
        assert_eq!(stats.category_unweighted["a"], None);
    }

    #[test]
    fn what_if_moves_weighted_but_not_unweighted() {
        let categories = vec![cat("a", 100.0, 0)];
        let assignments = vec![scored("a1", "a", 5.0, 10.0)];
        let what_if = WhatIf {
            category_id: "a".into(),
            points_earned: 10.0,
            points_possible: 10.0,
        };
        let stats = project_course_stats(&categories, &assignments, Some(&what_if));
        assert!((stats.overall_weighted - 0.75).abs() < EPS);
        assert!((stats.overall_unweighted - 0.5).abs() < EPS);
        assert_eq!(assignments.len(), 1);
    }

    #[test]
    fn invalid_what_if_is_ignored() {
        let what_if = WhatIf {
            category_id: "a".into(),
            points_earned: 3.0,
            points_possible: 0.0,
        };
        assert!(what_if.to_assignment().is_none());
        let assignments = vec![scored("a1", "a", 5.0, 10.0)];
        assert_eq!(with_what_if(&assignments, Some(&what_if)), assignments);
    }

    #[test]
    fn sentinel_is_stripped_from_write_back_ids() {
        let ids = without_what_if(vec!["x", WHAT_IF_ID, "y"]);
        assert_eq!(ids, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn format_pct_rounds_half_up() {
        assert_eq!(format_pct(None, 1), NO_GRADE);
        assert_eq!(format_pct(Some(0.8675), 1), "86.8%");
        assert_eq!(format_pct(Some(1.0), 1), "100.0%");
        assert_eq!(format_pct(Some(0.0), 1), "0.0%");
        assert_eq!(format_pct(Some(0.12345), 2), "12.35%");
        assert_eq!(format_pct(Some(0.5), 0), "50%");
    }

    #[test]
    fn recompute_is_stable() {
        let categories = vec![cat("a", 30.0, 1), cat("b", 70.0, 0)];
        let assignments = vec![
            scored("a1", "a", 3.0, 7.0),
            scored("a2", "a", 6.0, 7.0),
            scored("b1", "b", 11.0, 13.0),
        ];
        let first = compute_weighted_grade(&categories, &assignments);
        let second = compute_weighted_grade(&categories, &assignments);
        assert!((first.overall_pct - second.overall_pct).abs() < EPS);
        assert_eq!(first.by_category, second.by_category);
    }

    #[test]
    fn status_parsing_and_resolution() {
        assert_eq!("Graded".parse::<AssignmentStatus>(), Ok(AssignmentStatus::Graded));
        assert!(matches!(
            "done".parse::<AssignmentStatus>(),
            Err(ValidationError::UnknownStatus(_))
        ));
        assert_eq!(
            resolve_status(Some(AssignmentStatus::Submitted), None, Some(10.0)),
            AssignmentStatus::Planned
        );
        assert_eq!(resolve_status(None, Some(1.0), Some(10.0)), AssignmentStatus::Graded);
    }

    #[test]
    fn explicit_status_survives_updates_without_scores() {
        use AssignmentStatus::*;
        assert_eq!(resolve_updated_status(Some(Submitted), Planned, None, None), Submitted);
        assert_eq!(resolve_updated_status(Some(Missing), Graded, Some(1.0), None), Missing);
        assert_eq!(resolve_updated_status(None, Planned, Some(9.0), Some(10.0)), Graded);
        assert_eq!(resolve_updated_status(None, Graded, None, Some(10.0)), Planned);
        assert_eq!(resolve_updated_status(None, Submitted, None, None), Submitted);
    }

    #[test]
    fn boundary_validation() {
        assert_eq!(validate_weight(40.0), Ok(40.0));
        assert!(validate_weight(100.5).is_err());
        assert!(validate_weight(f64::INFINITY).is_err());
        assert_eq!(clamp_drop_lowest(2), 2);
        assert_eq!(clamp_drop_lowest(-1), 0);
        assert_eq!(clamp_drop_lowest(i64::MAX), u32::MAX);
        assert!(validate_points("pointsEarned", Some(f64::NAN)).is_err());
        assert_eq!(validate_points("pointsEarned", None), Ok(None));
    }
}
