//! Fixing "now" triggers to concrete times.

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;
use crate::timeline::{DevelopedTimeline, TimelineObject, TimelineResolver, Trigger};
use crate::types::Time;

/// Upper bound on develop-and-fix rounds per pass.
pub const MAX_FIX_ITERATIONS: usize = 10;

/// One rewritten trigger, reported so the owner can persist it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerTimeFix {
    pub id: String,
    pub time: Time,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NowFixation {
    pub fixed: Vec<TriggerTimeFix>,
    /// "now" objects still waiting on an unresolved parent.
    pub unresolved: Vec<String>,
    pub cap_reached: bool,
    /// Set when a round failed to resolve. The fixes gathered before the
    /// failure are already applied to the timeline and still need reporting.
    pub error: Option<ResolveError>,
}

/// Rewrite every "now" trigger in `timeline` relative to `now`.
///
/// Top-level objects get `now`. Objects in a group get `now` minus the
/// group's resolved start, which may only be known after an earlier round
/// has fixed the group itself.
pub fn fix_now_objects(
    timeline: &mut [TimelineObject],
    now: Time,
    resolver: &dyn TimelineResolver,
) -> NowFixation {
    let mut result = NowFixation::default();

    for obj in timeline.iter_mut() {
        if obj.enable.start.is_now() {
            obj.enable.start = Trigger::Absolute(now);
            result.fixed.push(TriggerTimeFix {
                id: obj.id.clone(),
                time: now,
            });
        }
    }

    result.cap_reached = true;
    for _ in 0..MAX_FIX_ITERATIONS {
        let developed = match resolver
            .get_timeline_in_window(timeline, None, None)
            .and_then(|window| resolver.develop_timeline_around_time(&window, now))
        {
            Ok(developed) => developed,
            Err(e) => {
                result.cap_reached = false;
                result.error = Some(e);
                return result;
            }
        };

        let mut round = Round::default();
        for obj in timeline.iter_mut() {
            fix_children(obj, &developed, now, &mut result.fixed, &mut round);
        }

        result.unresolved = round.blocked;
        if result.unresolved.is_empty() && !round.progress {
            result.cap_reached = false;
            break;
        }
    }

    result
}

#[derive(Default)]
struct Round {
    progress: bool,
    blocked: Vec<String>,
}

fn fix_children(
    parent: &mut TimelineObject,
    developed: &DevelopedTimeline,
    now: Time,
    fixed: &mut Vec<TriggerTimeFix>,
    round: &mut Round,
) {
    let parent_start = developed.group(&parent.id).map(|g| g.resolved.start);

    for child in parent.children.iter_mut() {
        if child.enable.start.is_now() {
            match parent_start {
                Some(start) => {
                    let time = now - start;
                    child.enable.start = Trigger::Absolute(time);
                    fixed.push(TriggerTimeFix {
                        id: child.id.clone(),
                        time,
                    });
                    round.progress = true;
                }
                None => round.blocked.push(child.id.clone()),
            }
        }
        fix_children(child, developed, now, fixed, round);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{BasicResolver, Enable};

    #[test]
    fn test_top_level_now_is_fixed_once() {
        let mut timeline = vec![
            TimelineObject::new("live", "L", Enable::now()),
            TimelineObject::new("fixed", "M", Enable::at(10)),
        ];

        let first = fix_now_objects(&mut timeline, 1234, &BasicResolver);
        assert_eq!(
            first.fixed,
            vec![TriggerTimeFix {
                id: "live".into(),
                time: 1234
            }]
        );
        assert_eq!(timeline[0].enable.start, Trigger::Absolute(1234));
        assert!(!first.cap_reached);
        assert_eq!(first.error, None);

        let second = fix_now_objects(&mut timeline, 2000, &BasicResolver);
        assert!(second.fixed.is_empty());
    }

    #[test]
    fn test_nested_now_is_relative_to_group() {
        let mut timeline = vec![TimelineObject::group(
            "g",
            Enable::at(1000),
            vec![TimelineObject::new("child", "L", Enable::now())],
        )];

        let result = fix_now_objects(&mut timeline, 1500, &BasicResolver);
        assert_eq!(
            result.fixed,
            vec![TriggerTimeFix {
                id: "child".into(),
                time: 500
            }]
        );
        assert_eq!(timeline[0].children[0].enable.start, Trigger::Absolute(500));
    }

    #[test]
    fn test_nested_groups_resolve_over_rounds() {
        let mut timeline = vec![TimelineObject::group(
            "outer",
            Enable::now(),
            vec![TimelineObject::group(
                "inner",
                Enable::now(),
                vec![TimelineObject::new("leaf", "L", Enable::now())],
            )],
        )];

        let result = fix_now_objects(&mut timeline, 800, &BasicResolver);
        let times: Vec<_> = result.fixed.iter().map(|f| (f.id.as_str(), f.time)).collect();
        assert_eq!(times, vec![("outer", 800), ("inner", 0), ("leaf", 0)]);
        assert!(result.unresolved.is_empty());
    }

    #[test]
    fn test_unresolvable_parent_hits_cap() {
        let mut timeline = vec![TimelineObject::group(
            "g",
            Enable::expression("#missing.end"),
            vec![TimelineObject::new("child", "L", Enable::now())],
        )];

        let result = fix_now_objects(&mut timeline, 100, &BasicResolver);
        assert!(result.cap_reached);
        assert_eq!(result.unresolved, vec!["child".to_string()]);
        assert!(timeline[0].children[0].enable.start.is_now());
    }

    #[test]
    fn test_fixes_survive_a_resolve_failure() {
        let mut timeline = vec![
            TimelineObject::new("live", "L", Enable::now()),
            TimelineObject::new("bad", "M", Enable::expression("#live.start * 2")),
        ];

        let result = fix_now_objects(&mut timeline, 100, &BasicResolver);
        assert_eq!(
            result.fixed,
            vec![TriggerTimeFix {
                id: "live".into(),
                time: 100
            }]
        );
        assert!(matches!(
            result.error,
            Some(ResolveError::InvalidExpression { ref object_id, .. }) if object_id == "bad"
        ));
        assert!(!result.cap_reached);
        assert_eq!(timeline[0].enable.start, Trigger::Absolute(100));
    }
}
