//! Subscription plans and the creation limits they grant.
//!
//! Limits are consulted only when a secret is created. Unknown plan names
//! fall back to the anonymous tier; an authenticated caller whose provider
//! reports no plan is treated as an explorer.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plan {
    Anonymous,
    Explorer,
    Challenger,
    Dominator,
}

impl Plan {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "explorer" => Self::Explorer,
            "challenger" => Self::Challenger,
            "dominator" => Self::Dominator,
            _ => Self::Anonymous,
        }
    }

    /// Plan for a caller: `None` subject is anonymous, a known subject
    /// without a plan is an explorer.
    pub fn for_caller(authenticated: bool, plan_name: Option<&str>) -> Self {
        match (authenticated, plan_name) {
            (false, _) => Self::Anonymous,
            (true, None) => Self::Explorer,
            (true, Some(name)) => Self::from_name(name),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Explorer => "explorer",
            Self::Challenger => "challenger",
            Self::Dominator => "dominator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub daily_create_limit: u32,
    /// Maximum characters of text content.
    pub char_limit: usize,
    /// Maximum size in bytes of image content as submitted.
    pub file_size_limit: usize,
}

pub trait PlanProvider: Send + Sync {
    fn limits(&self, plan: Plan) -> PlanLimits;
}

/// Fixed limits table.
#[derive(Debug, Clone)]
pub struct StaticPlanProvider {
    anonymous: PlanLimits,
    explorer: PlanLimits,
    challenger: PlanLimits,
    dominator: PlanLimits,
}

const MIB: usize = 1024 * 1024;

impl Default for StaticPlanProvider {
    fn default() -> Self {
        Self {
            anonymous: PlanLimits {
                daily_create_limit: 10,
                char_limit: 1_000,
                file_size_limit: MIB,
            },
            explorer: PlanLimits {
                daily_create_limit: 50,
                char_limit: 5_000,
                file_size_limit: 5 * MIB,
            },
            challenger: PlanLimits {
                daily_create_limit: 200,
                char_limit: 20_000,
                file_size_limit: 20 * MIB,
            },
            dominator: PlanLimits {
                daily_create_limit: 1_000,
                char_limit: 100_000,
                file_size_limit: 50 * MIB,
            },
        }
    }
}

impl StaticPlanProvider {
    pub fn with_limits(mut self, plan: Plan, limits: PlanLimits) -> Self {
        match plan {
            Plan::Anonymous => self.anonymous = limits,
            Plan::Explorer => self.explorer = limits,
            Plan::Challenger => self.challenger = limits,
            Plan::Dominator => self.dominator = limits,
        }
        self
    }
}

impl PlanProvider for StaticPlanProvider {
    fn limits(&self, plan: Plan) -> PlanLimits {
        match plan {
            Plan::Anonymous => self.anonymous,
            Plan::Explorer => self.explorer,
            Plan::Challenger => self.challenger,
            Plan::Dominator => self.dominator,
        }
    }
}
