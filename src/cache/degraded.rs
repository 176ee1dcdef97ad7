use chrono::Utc;

use crate::ensemble::{predicted_score, MatchRequest, Prediction};
use crate::features::{FallbackPolicy, FeatureVector, Side};
use crate::models::three_way;

/// Fixed confidence reported for degraded predictions.
pub const DEGRADED_CONFIDENCE: f64 = 0.3;

/// Neutral league-average prediction built only from static defaults.
///
/// Used when neither the live path nor the cache can answer; it never touches
/// models, sources or I/O, so it cannot fail.
pub fn degraded_prediction(
    request: &MatchRequest,
    policy: &FallbackPolicy,
    tie_share: f64,
) -> Prediction {
    let [p_home_win, p_away_win, p_other] = three_way(policy.default_win_pct, tie_share);
    let goals = policy.league_avg_goals;
    let winner = if p_away_win > p_home_win { Side::Away } else { Side::Home };
    let predicted_winner = match winner {
        Side::Home => request.home_team.clone(),
        Side::Away => request.away_team.clone(),
    };

    Prediction {
        match_id: request.match_id.clone(),
        generated_at: Utc::now(),
        home_team: request.home_team.clone(),
        away_team: request.away_team.clone(),
        predicted_winner,
        winner_side: winner,
        predicted_score: predicted_score(goals, goals, winner),
        p_home_win,
        p_away_win,
        p_other,
        confidence: DEGRADED_CONFIDENCE,
        data_quality: 0.0,
        models: Vec::new(),
        features: FeatureVector::defaults(policy),
        scheduled_at: request.scheduled_at,
        degraded: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    #[test]
    fn test_degraded_is_neutral_and_flagged() {
        let request = MatchRequest {
            match_id: "m1".into(),
            home_team: "BOS".into(),
            away_team: "TOR".into(),
            date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            scheduled_at: None,
        };
        let p = degraded_prediction(&request, &FallbackPolicy::default(), 0.22);
        assert!(p.degraded);
        assert_eq!(p.predicted_winner, "BOS");
        assert_relative_eq!(p.p_home_win, p.p_away_win);
        assert_relative_eq!(p.p_home_win + p.p_away_win + p.p_other, 1.0, epsilon = 1e-12);
        assert_eq!(p.confidence, DEGRADED_CONFIDENCE);
        assert!(p.predicted_score.home > p.predicted_score.away);
        assert!(p.models.is_empty());
    }
}
