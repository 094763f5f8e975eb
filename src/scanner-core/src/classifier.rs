//! Pure mapping from accumulated window observables to the three reporting
//! labels. No I/O, no clock reads — deterministic in, deterministic out.

use crate::models::{Classification, CloseReason, OpenDurationClass, OpportunityClass, WindowObservables};

/// Classify a closed window's observables. Only called for windows that
/// reached `Open`; single-tick windows are discarded before this is reached.
pub fn classify(observables: WindowObservables) -> Classification {
    debug_assert_eq!(observables.open_duration_class, OpenDurationClass::MultiTick);

    let close_reason = if observables.trade_event_fired {
        if observables.volume_change_ticks > 1 {
            CloseReason::VolumeSpikeGradual
        } else {
            CloseReason::VolumeSpikeInstant
        }
    } else if observables.price_shifted {
        CloseReason::PriceDrift
    } else {
        CloseReason::OrderVanished
    };

    let opportunity_class = match close_reason {
        CloseReason::VolumeSpikeGradual => OpportunityClass::Best,
        CloseReason::PriceDrift => OpportunityClass::Good,
        CloseReason::VolumeSpikeInstant => OpportunityClass::FastRequired,
        CloseReason::OrderVanished => OpportunityClass::LowValue,
    };

    Classification {
        open_duration_class: observables.open_duration_class,
        close_reason: Some(close_reason),
        opportunity_class,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observables(trade_fired: bool, volume_ticks: u32, price_shifted: bool) -> WindowObservables {
        WindowObservables {
            open_duration_class: OpenDurationClass::MultiTick,
            trade_event_fired: trade_fired,
            volume_change_ticks: volume_ticks,
            price_shifted,
        }
    }

    #[test]
    fn gradual_volume_spike_is_best() {
        let c = classify(observables(true, 2, false));
        assert_eq!(c.close_reason, Some(CloseReason::VolumeSpikeGradual));
        assert_eq!(c.opportunity_class, OpportunityClass::Best);
    }

    #[test]
    fn instant_volume_spike_is_fast_required() {
        let c = classify(observables(true, 1, false));
        assert_eq!(c.close_reason, Some(CloseReason::VolumeSpikeInstant));
        assert_eq!(c.opportunity_class, OpportunityClass::FastRequired);
    }

    #[test]
    fn price_drift_without_trade_is_good() {
        let c = classify(observables(false, 0, true));
        assert_eq!(c.close_reason, Some(CloseReason::PriceDrift));
        assert_eq!(c.opportunity_class, OpportunityClass::Good);
    }

    #[test]
    fn order_vanished_without_trade_or_drift_is_low_value() {
        let c = classify(observables(false, 0, false));
        assert_eq!(c.close_reason, Some(CloseReason::OrderVanished));
        assert_eq!(c.opportunity_class, OpportunityClass::LowValue);
    }

    #[test]
    fn is_a_pure_function_of_its_input() {
        let obs = observables(true, 3, true);
        assert_eq!(classify(obs).opportunity_class, classify(obs).opportunity_class);
        assert_eq!(classify(obs).close_reason, classify(obs).close_reason);
    }

    #[test]
    fn scenario_s2_gradual_volume() {
        let c = classify(observables(true, 2, false));
        assert_eq!(c.opportunity_class, OpportunityClass::Best);
    }

    #[test]
    fn scenario_s3_drift() {
        let c = classify(observables(false, 0, true));
        assert_eq!(c.opportunity_class, OpportunityClass::Good);
    }

    #[test]
    fn scenario_s4_instant_vanish() {
        let c = classify(observables(true, 1, false));
        assert_eq!(c.opportunity_class, OpportunityClass::FastRequired);
    }
}
