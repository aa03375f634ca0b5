use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transition failures carry enough shape for the API layer to pick a
/// response code: `Terminal` and `Invalid` both mean the caller raced or
/// repeated a decision (conflict), `Unknown` means a corrupt stored value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{entity} is already {status}; it accepts no further decisions")]
    Terminal {
        entity: &'static str,
        status: &'static str,
    },
    #[error("{entity} cannot move from {from} to {to}")]
    Invalid {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },
    #[error("unknown {entity} status '{value}'")]
    Unknown { entity: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AffiliateStatus {
    Pending,
    Active,
    Suspended,
    Banned,
}

/// Admin commands against an affiliate record. Verification is not a
/// command here: it is an orthogonal flag, see [`AffiliateStatus::can_verify`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AffiliateCommand {
    Activate,
    Suspend,
    Ban,
}

impl AffiliateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Banned => "banned",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TransitionError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "banned" => Ok(Self::Banned),
            _ => Err(TransitionError::Unknown {
                entity: "affiliate",
                value: value.to_string(),
            }),
        }
    }

    /// `banned` ends program participation; nothing leads back out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Banned)
    }

    /// Earnings accrue only while active.
    pub fn earns(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// The verification flag may be set while pending or active and is
    /// never reset once true.
    pub fn can_verify(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    /// Validates and applies an admin command. There is deliberately no
    /// path out of `suspended` other than `ban`.
    pub fn apply(self, command: AffiliateCommand) -> Result<Self, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal {
                entity: "affiliate",
                status: self.as_str(),
            });
        }

        let target = match command {
            AffiliateCommand::Activate => Self::Active,
            AffiliateCommand::Suspend => Self::Suspended,
            AffiliateCommand::Ban => Self::Banned,
        };

        match (self, command) {
            (Self::Pending, AffiliateCommand::Activate) => Ok(Self::Active),
            (Self::Active, AffiliateCommand::Suspend) => Ok(Self::Suspended),
            (_, AffiliateCommand::Ban) => Ok(Self::Banned),
            _ => Err(TransitionError::Invalid {
                entity: "affiliate",
                from: self.as_str(),
                to: target.as_str(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Approved,
    Rejected,
}

impl CommissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TransitionError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(TransitionError::Unknown {
                entity: "commission",
                value: value.to_string(),
            }),
        }
    }

    pub fn is_decided(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn approve(self) -> Result<Self, TransitionError> {
        match self {
            Self::Pending => Ok(Self::Approved),
            decided => Err(TransitionError::Terminal {
                entity: "commission",
                status: decided.as_str(),
            }),
        }
    }

    pub fn reject(self) -> Result<Self, TransitionError> {
        match self {
            Self::Pending => Ok(Self::Rejected),
            decided => Err(TransitionError::Terminal {
                entity: "commission",
                status: decided.as_str(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TransitionError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            _ => Err(TransitionError::Unknown {
                entity: "payout",
                value: value.to_string(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }

    /// Only a completed payout ever carries a transaction id.
    pub fn allows_transaction_id(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn process(self) -> Result<Self, TransitionError> {
        match self {
            Self::Pending => Ok(Self::Processing),
            Self::Processing => Err(TransitionError::Invalid {
                entity: "payout",
                from: self.as_str(),
                to: "processing",
            }),
            terminal => Err(TransitionError::Terminal {
                entity: "payout",
                status: terminal.as_str(),
            }),
        }
    }

    pub fn complete(self) -> Result<Self, TransitionError> {
        match self {
            Self::Processing => Ok(Self::Completed),
            Self::Pending => Err(TransitionError::Invalid {
                entity: "payout",
                from: self.as_str(),
                to: "completed",
            }),
            terminal => Err(TransitionError::Terminal {
                entity: "payout",
                status: terminal.as_str(),
            }),
        }
    }

    pub fn reject(self) -> Result<Self, TransitionError> {
        match self {
            Self::Pending | Self::Processing => Ok(Self::Rejected),
            terminal => Err(TransitionError::Terminal {
                entity: "payout",
                status: terminal.as_str(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    Paypal,
    BankTransfer,
    Card,
}

impl PayoutMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paypal => "paypal",
            Self::BankTransfer => "bank_transfer",
            Self::Card => "card",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TransitionError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "paypal" => Ok(Self::Paypal),
            "bank_transfer" => Ok(Self::BankTransfer),
            "card" => Ok(Self::Card),
            _ => Err(TransitionError::Unknown {
                entity: "payout method",
                value: value.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affiliate_happy_path() {
        let status = AffiliateStatus::Pending;
        let status = status.apply(AffiliateCommand::Activate).unwrap();
        assert_eq!(status, AffiliateStatus::Active);
        let status = status.apply(AffiliateCommand::Suspend).unwrap();
        assert_eq!(status, AffiliateStatus::Suspended);
    }

    #[test]
    fn affiliate_has_no_path_out_of_suspended_except_ban() {
        let suspended = AffiliateStatus::Suspended;
        assert!(matches!(
            suspended.apply(AffiliateCommand::Activate),
            Err(TransitionError::Invalid { .. })
        ));
        assert!(matches!(
            suspended.apply(AffiliateCommand::Suspend),
            Err(TransitionError::Invalid { .. })
        ));
        assert_eq!(
            suspended.apply(AffiliateCommand::Ban).unwrap(),
            AffiliateStatus::Banned
        );
    }

    #[test]
    fn ban_is_reachable_from_every_non_terminal_state_and_is_terminal() {
        for from in [
            AffiliateStatus::Pending,
            AffiliateStatus::Active,
            AffiliateStatus::Suspended,
        ] {
            assert_eq!(
                from.apply(AffiliateCommand::Ban).unwrap(),
                AffiliateStatus::Banned
            );
        }

        for command in [
            AffiliateCommand::Activate,
            AffiliateCommand::Suspend,
            AffiliateCommand::Ban,
        ] {
            assert!(matches!(
                AffiliateStatus::Banned.apply(command),
                Err(TransitionError::Terminal { .. })
            ));
        }
    }

    #[test]
    fn verification_is_allowed_only_while_pending_or_active() {
        assert!(AffiliateStatus::Pending.can_verify());
        assert!(AffiliateStatus::Active.can_verify());
        assert!(!AffiliateStatus::Suspended.can_verify());
        assert!(!AffiliateStatus::Banned.can_verify());
    }

    #[test]
    fn decided_commissions_accept_no_further_decisions() {
        let approved = CommissionStatus::Pending.approve().unwrap();
        assert_eq!(approved, CommissionStatus::Approved);
        assert!(matches!(
            approved.approve(),
            Err(TransitionError::Terminal { .. })
        ));
        assert!(matches!(
            approved.reject(),
            Err(TransitionError::Terminal { .. })
        ));

        let rejected = CommissionStatus::Pending.reject().unwrap();
        assert!(matches!(
            rejected.approve(),
            Err(TransitionError::Terminal { .. })
        ));
        assert!(matches!(
            rejected.reject(),
            Err(TransitionError::Terminal { .. })
        ));
    }

    #[test]
    fn payout_moves_strictly_forward() {
        let status = PayoutStatus::Pending;
        assert!(matches!(
            status.complete(),
            Err(TransitionError::Invalid { .. })
        ));

        let processing = status.process().unwrap();
        assert_eq!(processing, PayoutStatus::Processing);
        assert!(matches!(
            processing.process(),
            Err(TransitionError::Invalid { .. })
        ));

        let completed = processing.complete().unwrap();
        assert_eq!(completed, PayoutStatus::Completed);
        assert!(completed.allows_transaction_id());
    }

    #[test]
    fn terminal_payouts_accept_nothing() {
        for terminal in [PayoutStatus::Completed, PayoutStatus::Rejected] {
            assert!(matches!(
                terminal.process(),
                Err(TransitionError::Terminal { .. })
            ));
            assert!(matches!(
                terminal.complete(),
                Err(TransitionError::Terminal { .. })
            ));
            assert!(matches!(
                terminal.reject(),
                Err(TransitionError::Terminal { .. })
            ));
        }
    }

    #[test]
    fn payout_rejection_is_reachable_from_pending_and_processing() {
        assert_eq!(
            PayoutStatus::Pending.reject().unwrap(),
            PayoutStatus::Rejected
        );
        assert_eq!(
            PayoutStatus::Processing.reject().unwrap(),
            PayoutStatus::Rejected
        );
    }

    #[test]
    fn statuses_round_trip_through_their_wire_strings() {
        for status in [
            AffiliateStatus::Pending,
            AffiliateStatus::Active,
            AffiliateStatus::Suspended,
            AffiliateStatus::Banned,
        ] {
            assert_eq!(AffiliateStatus::parse(status.as_str()).unwrap(), status);
        }
        assert_eq!(
            PayoutMethod::parse("BANK_TRANSFER").unwrap(),
            PayoutMethod::BankTransfer
        );
        assert!(PayoutStatus::parse("settled").is_err());
    }
}
