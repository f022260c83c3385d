use std::fmt;
use std::time::Duration;

use surge_metrics::MetricKind;

/// `metric` or `metric{key:value,...}`.
///
/// Only the first `:` of each pair separates key from value, so `group:::login` selects
/// `group = "::login"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub metric: String,
    pub tags: Vec<(String, String)>,
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let Some(open) = raw.find('{') else {
            if raw.is_empty() || raw.contains('}') {
                return Err(format!("invalid metric selector: `{raw}`"));
            }
            return Ok(Self {
                metric: raw.to_string(),
                tags: Vec::new(),
            });
        };

        let metric = raw[..open].trim();
        let Some(body) = raw[open + 1..].strip_suffix('}') else {
            return Err(format!("unterminated tag filter in selector: `{raw}`"));
        };
        if metric.is_empty() {
            return Err(format!("missing metric name in selector: `{raw}`"));
        }

        let mut tags = Vec::new();
        for pair in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((k, v)) = pair.split_once(':') else {
                return Err(format!("tag filter `{pair}` is not `key:value`"));
            };
            let k = k.trim();
            if k.is_empty() {
                return Err(format!("empty tag key in selector: `{raw}`"));
            }
            tags.push((k.to_string(), v.trim().to_string()));
        }

        Ok(Self {
            metric: metric.to_string(),
            tags,
        })
    }

    pub fn tag_refs(&self) -> Vec<(&str, &str)> {
        self.tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric)?;
        if !self.tags.is_empty() {
            f.write_str("{")?;
            for (i, (k, v)) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{k}:{v}")?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ThresholdOp {
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Lte,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Gte,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    NotEq,
}

impl ThresholdOp {
    pub fn compare(self, observed: f64, expected: f64) -> bool {
        match self {
            Self::Lt => observed < expected,
            Self::Lte => observed <= expected,
            Self::Gt => observed > expected,
            Self::Gte => observed >= expected,
            Self::Eq => observed == expected,
            Self::NotEq => observed != expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdAgg {
    Avg,
    Min,
    Max,
    Med,
    Count,
    /// Fraction of true samples for rates; per-second throughput for counters.
    Rate,
    Value,
    /// Percentile in `(0, 100]`.
    P(f64),
}

impl ThresholdAgg {
    /// Whether this aggregation means anything for a metric of `kind`.
    pub fn applies_to(self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Trend => matches!(
                self,
                Self::Avg | Self::Min | Self::Max | Self::Med | Self::Count | Self::P(_)
            ),
            MetricKind::Rate => matches!(self, Self::Rate | Self::Count),
            MetricKind::Counter => matches!(self, Self::Count | Self::Rate),
            MetricKind::Gauge => matches!(self, Self::Value),
        }
    }
}

impl fmt::Display for ThresholdAgg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Value => f.write_str("value"),
            Self::P(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub agg: ThresholdAgg,
    pub op: ThresholdOp,
    /// Trend literals with a unit suffix are normalized to milliseconds.
    pub value: f64,
}

pub fn parse_threshold_expr(raw: &str) -> Result<ThresholdExpr, String> {
    let s: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return Err("empty threshold".to_string());
    }

    // Two-character operators first so `<=` is not read as `<`.
    let ops = [
        ("<=", ThresholdOp::Lte),
        (">=", ThresholdOp::Gte),
        ("==", ThresholdOp::Eq),
        ("!=", ThresholdOp::NotEq),
        ("<", ThresholdOp::Lt),
        (">", ThresholdOp::Gt),
    ];
    let (op_pos, op_len, op) = ops
        .iter()
        .find_map(|(tok, op)| s.find(tok).map(|pos| (pos, tok.len(), *op)))
        .ok_or_else(|| format!("missing comparison operator in `{raw}`"))?;

    let (left, right_with_op) = s.split_at(op_pos);
    let right = &right_with_op[op_len..];
    if left.is_empty() || right.is_empty() {
        return Err(format!("incomplete threshold `{raw}`"));
    }

    let agg = parse_agg(left).ok_or_else(|| format!("unknown aggregation `{left}` in `{raw}`"))?;
    if let ThresholdAgg::P(p) = agg
        && !(p > 0.0 && p <= 100.0)
    {
        return Err(format!("percentile out of range in `{raw}`"));
    }

    let value = parse_literal(right).ok_or_else(|| format!("invalid numeric value in `{raw}`"))?;

    Ok(ThresholdExpr { agg, op, value })
}

fn parse_agg(s: &str) -> Option<ThresholdAgg> {
    let lower = s.to_ascii_lowercase();
    let agg = match lower.as_str() {
        "avg" => ThresholdAgg::Avg,
        "min" => ThresholdAgg::Min,
        "max" => ThresholdAgg::Max,
        "med" => ThresholdAgg::Med,
        "count" => ThresholdAgg::Count,
        "rate" => ThresholdAgg::Rate,
        "value" => ThresholdAgg::Value,
        other => {
            let inner = other
                .strip_prefix("p(")
                .and_then(|v| v.strip_suffix(')'))
                .or_else(|| other.strip_prefix('p'))?;
            ThresholdAgg::P(inner.parse().ok()?)
        }
    };
    Some(agg)
}

fn parse_literal(s: &str) -> Option<f64> {
    let (number, scale) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix("us") {
        (n, 0.001)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1000.0)
    } else {
        (s, 1.0)
    };
    let v: f64 = number.parse().ok()?;
    v.is_finite().then_some(v * scale)
}

/// A validated threshold, fixed for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub selector: Selector,
    /// Expression as written in the run options.
    pub source: String,
    pub expr: ThresholdExpr,
    pub abort_on_fail: bool,
    /// Abort is suppressed until this much run time has passed.
    pub delay_abort_eval: Option<Duration>,
}

impl Threshold {
    pub fn parse(selector: &str, expression: &str) -> Result<Self, String> {
        Ok(Self {
            selector: Selector::parse(selector)?,
            source: expression.trim().to_string(),
            expr: parse_threshold_expr(expression)?,
            abort_on_fail: false,
            delay_abort_eval: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_threshold_expr_trims_whitespace() {
        let expr = parse_threshold_expr("  avg  <=  123  ").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(expr.agg, ThresholdAgg::Avg);
        assert_eq!(expr.op, ThresholdOp::Lte);
        assert_eq!(expr.value, 123.0);
    }

    #[test]
    fn parses_percentile_forms_and_units() {
        let a = parse_threshold_expr("p(95)<800ms").unwrap_or_else(|e| panic!("{e}"));
        let b = parse_threshold_expr("p95 < 0.8s").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(a.agg, ThresholdAgg::P(95.0));
        assert_eq!(a, b);

        let c = parse_threshold_expr("p(99.9)<=500us").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(c.agg, ThresholdAgg::P(99.9));
        assert_eq!(c.value, 0.5);

        let d = parse_threshold_expr("med!=0").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(d.op, ThresholdOp::NotEq);
    }

    #[test]
    fn rejects_bad_expressions() {
        for raw in ["", "p(101)<1", "p(0)<1", "avg 100", "foo<1", "rate<abc", "<1"] {
            assert!(parse_threshold_expr(raw).is_err(), "{raw} should fail");
        }
    }

    #[test]
    fn selector_splits_on_first_colon() {
        let sel = Selector::parse("group_duration{group:::01_login}")
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(sel.metric, "group_duration");
        assert_eq!(sel.tags, vec![("group".to_string(), "::01_login".to_string())]);
        assert_eq!(sel.to_string(), "group_duration{group:::01_login}");

        let multi = Selector::parse("http_req_duration{ status:200 , method:GET }")
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(multi.tags.len(), 2);

        let plain = Selector::parse("checks").unwrap_or_else(|e| panic!("{e}"));
        assert!(plain.tags.is_empty());
    }

    #[test]
    fn selector_rejects_malformed_input() {
        for raw in ["", "{a:b}", "m{a:b", "m{ab}", "m{:b}"] {
            assert!(Selector::parse(raw).is_err(), "{raw} should fail");
        }
    }

    #[test]
    fn aggregation_kind_compatibility() {
        assert!(ThresholdAgg::P(95.0).applies_to(MetricKind::Trend));
        assert!(!ThresholdAgg::P(95.0).applies_to(MetricKind::Rate));
        assert!(ThresholdAgg::Rate.applies_to(MetricKind::Counter));
        assert!(ThresholdAgg::Value.applies_to(MetricKind::Gauge));
        assert!(!ThresholdAgg::Avg.applies_to(MetricKind::Counter));
    }
}
