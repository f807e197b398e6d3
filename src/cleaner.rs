/// Strips everything except digits, `.` and `-`, then parses what is left.
///
/// Absent, empty or unparsable input (a lone `-`, two decimal points, a minus
/// sign in the middle) yields `0.0`. The result is always finite.
pub fn clean(raw: Option<&str>) -> f64 {
    let Some(raw) = raw else {
        return 0.0;
    };

    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
        .collect();

    kept.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}
