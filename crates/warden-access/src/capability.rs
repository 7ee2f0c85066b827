use serde::{Deserialize, Serialize};

pub const CAPABILITY_ALERTS_EXPLAIN: &str = "alerts.explain";
pub const CAPABILITY_ALERTS_STRATEGY: &str = "alerts.strategy";
pub const CAPABILITY_ALERTS_QUERY: &str = "alerts.query";
pub const CAPABILITY_OPS_STATUS: &str = "ops.status";
pub const CAPABILITY_OPS_PS: &str = "ops.ps";
pub const CAPABILITY_OPS_LOGS: &str = "ops.logs";
pub const CAPABILITY_OPS_CHART_FACTOR_TIMELINE: &str = "ops.chart.factor_timeline";
pub const CAPABILITY_OPS_CHART_DAILY_ACTIVITY: &str = "ops.chart.daily_activity";
pub const CAPABILITY_OPS_DASHBOARD_EXPORT: &str = "ops.dashboard.export";

const OPS_CAPABILITY_PREFIX: &str = "ops.";

/// Capability tokens the router emits. The string forms are the join key
/// against policy rules and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "alerts.explain")]
    AlertsExplain,
    #[serde(rename = "alerts.strategy")]
    AlertsStrategy,
    #[serde(rename = "alerts.query")]
    AlertsQuery,
    #[serde(rename = "ops.status")]
    OpsStatus,
    #[serde(rename = "ops.ps")]
    OpsPs,
    #[serde(rename = "ops.logs")]
    OpsLogs,
    #[serde(rename = "ops.chart.factor_timeline")]
    OpsChartFactorTimeline,
    #[serde(rename = "ops.chart.daily_activity")]
    OpsChartDailyActivity,
    #[serde(rename = "ops.dashboard.export")]
    OpsDashboardExport,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Self::AlertsExplain,
        Self::AlertsStrategy,
        Self::AlertsQuery,
        Self::OpsStatus,
        Self::OpsPs,
        Self::OpsLogs,
        Self::OpsChartFactorTimeline,
        Self::OpsChartDailyActivity,
        Self::OpsDashboardExport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlertsExplain => CAPABILITY_ALERTS_EXPLAIN,
            Self::AlertsStrategy => CAPABILITY_ALERTS_STRATEGY,
            Self::AlertsQuery => CAPABILITY_ALERTS_QUERY,
            Self::OpsStatus => CAPABILITY_OPS_STATUS,
            Self::OpsPs => CAPABILITY_OPS_PS,
            Self::OpsLogs => CAPABILITY_OPS_LOGS,
            Self::OpsChartFactorTimeline => CAPABILITY_OPS_CHART_FACTOR_TIMELINE,
            Self::OpsChartDailyActivity => CAPABILITY_OPS_CHART_DAILY_ACTIVITY,
            Self::OpsDashboardExport => CAPABILITY_OPS_DASHBOARD_EXPORT,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|capability| capability.as_str() == raw)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Families that carry group-chat preconditions in policy rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityFamily {
    Explain,
    Ops,
    Other,
}

pub fn capability_family(capability: &str) -> CapabilityFamily {
    let capability = capability.trim();
    if capability == CAPABILITY_ALERTS_EXPLAIN {
        CapabilityFamily::Explain
    } else if capability.starts_with(OPS_CAPABILITY_PREFIX) {
        CapabilityFamily::Ops
    } else {
        CapabilityFamily::Other
    }
}
