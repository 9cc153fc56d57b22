//! Weighted edge selection for a single stage.
//!
//! A stage edge is chosen in two steps. First an edge group is drawn by
//! walking the stage's groups with a cumulative probability pointer: groups
//! seen under the current history share mass proportional to their weighted
//! best score, and every unseen group keeps a uniform `1 / groups` share.
//! Then each parameter value id is drawn with a biased binary search over
//! the cumulative mass of `[0, m]`, mixing unexplored ids uniformly with the
//! weighted scores of explored ones.

use log::{debug, trace, warn};
use rand::Rng;

use crate::schema::{Edge, EdgeGroup, Parameter, Stage, StageChoice};
use crate::store::{ScoreStore, StoreError};

use super::temperature::{relative_score_for_element, relative_score_sum};

/// Choose, materialize and persist an edge for `stage`.
///
/// `history` holds the choices made for the stages before this one.
pub fn select_edge<S, R>(
    store: &mut S,
    stage: &Stage,
    history: &[StageChoice],
    temperature: f64,
    rng: &mut R,
) -> Result<Edge, StoreError>
where
    S: ScoreStore + ?Sized,
    R: Rng,
{
    let group = choose_group(store, stage, history, temperature, rng)?;

    let mut ids = Vec::with_capacity(group.parameters.len());
    for param in &group.parameters {
        ids.push(choose_value_id(
            store,
            stage.id(),
            history,
            group,
            param,
            temperature,
            rng,
        )?);
    }

    let mut edge = group.edge_from_ids(&ids).unwrap_or_else(|err| {
        warn!("Did not select a new edge ({}), falling back to maximum values", err);
        group.max_edge()
    });
    edge.id = store.add_edge(&group.name, &edge.values, &group.parameters)?;
    debug!(
        "Stage {}: selected edge {} of group {} ({})",
        stage.id(),
        edge.id,
        edge.group,
        edge.values.join(", ")
    );
    Ok(edge)
}

/// Draw one of the stage's groups.
///
/// Falls back to the first group if the pointer never passes the draw,
/// which can only happen when stored scores name groups the stage no
/// longer has.
pub fn choose_group<'a, S, R>(
    store: &mut S,
    stage: &'a Stage,
    history: &[StageChoice],
    temperature: f64,
    rng: &mut R,
) -> Result<&'a EdgeGroup, StoreError>
where
    S: ScoreStore + ?Sized,
    R: Rng,
{
    let groups = stage.groups();
    if groups.len() == 1 {
        return Ok(&groups[0]);
    }

    let target: f64 = rng.r#gen();
    let scores = store.edge_group_scores(stage.id(), history)?;
    let values: Vec<f64> = scores.iter().map(|g| g.score).collect();
    let group_sum = relative_score_sum(&values, temperature);

    let scored = scores.len();
    let visited_share = scored as f64 / groups.len() as f64;
    let mut remaining: Vec<_> = scores.iter().enumerate().collect();
    let mut pointer = 0.0;

    for group in groups {
        match remaining.iter().position(|(_, g)| g.group == group.name) {
            Some(pos) => {
                let (rank, g) = remaining.remove(pos);
                if group_sum > 0.0 {
                    let weight = relative_score_for_element(g.score, temperature, rank, scored);
                    pointer += weight / group_sum * visited_share;
                }
            }
            None => pointer += 1.0 / groups.len() as f64,
        }
        trace!("Group {}: pointer {:.6} (target {:.6})", group.name, pointer, target);
        if pointer > target {
            return Ok(group);
        }
    }

    Ok(&groups[0])
}

/// Draw a value id for `param` with a biased binary search.
///
/// Always returns an id in `[0, param.max_id()]`.
pub fn choose_value_id<S, R>(
    store: &mut S,
    stage: usize,
    history: &[StageChoice],
    group: &EdgeGroup,
    param: &Parameter,
    temperature: f64,
    rng: &mut R,
) -> Result<u64, StoreError>
where
    S: ScoreStore + ?Sized,
    R: Rng,
{
    let count = param.possibilities();
    if count < 2 {
        return Ok(0);
    }
    let max_id = param.max_id();
    let target: f64 = rng.r#gen();

    let all = store.score_sum_for_param_range(stage, history, &group.name, param, max_id, temperature)?;
    let denominator = count as f64 * all.score;
    let visited_multiply = if denominator > 0.0 {
        all.visited as f64 / denominator
    } else {
        0.0
    };

    // Cumulative selection mass of ids [0, m].
    let mut mass = |m: u64| -> Result<f64, StoreError> {
        let range = store.score_sum_for_param_range(stage, history, &group.name, param, m, temperature)?;
        let unexplored = (m + 1).saturating_sub(range.visited) as f64 / count as f64;
        Ok(unexplored + visited_multiply * range.score)
    };

    let (mut left, mut right) = (0u64, max_id);
    let mut mid = 0;
    while left <= right {
        mid = left + (right - left) / 2;
        let compare = mass(mid)?;
        trace!(
            "{}: m={} (left {}, right {}) mass {:.6} target {:.6}",
            param.name(),
            mid,
            left,
            right,
            compare,
            target
        );

        if compare < target {
            left = mid + 1;
            continue;
        }
        let below = if mid == 0 { 0.0 } else { mass(mid - 1)? };
        if below < target {
            return Ok(mid);
        }
        if mid == 0 {
            break;
        }
        right = mid - 1;
    }

    trace!("{}: search exhausted at m={}", param.name(), mid);
    Ok(mid.min(max_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Parameter, Workflow};
    use crate::store::{RetryPolicy, SqliteStore};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn workflow() -> Workflow {
        Workflow::new(vec![
            vec![EdgeGroup::new("single", vec![], "")],
            vec![
                EdgeGroup::new(
                    "wide",
                    vec![Parameter::integer("w", 0, 99, 1).unwrap()],
                    "$#w#$",
                ),
                EdgeGroup::new(
                    "narrow",
                    vec![Parameter::integer("n", 0, 2, 1).unwrap()],
                    "$#n#$",
                ),
            ],
        ])
        .unwrap()
    }

    fn store(workflow: &Workflow) -> SqliteStore {
        let mut store = SqliteStore::open_in_memory("sel", RetryPolicy::none()).unwrap();
        store.prepare_run(workflow.len()).unwrap();
        for stage in workflow.stages() {
            for group in stage.groups() {
                store
                    .create_edge_group(&group.name, &group.parameter_names())
                    .unwrap();
            }
        }
        store
    }

    #[test]
    fn test_single_group_stage() {
        let wf = workflow();
        let mut store = store(&wf);
        let mut rng = StdRng::seed_from_u64(1);

        let edge = select_edge(&mut store, &wf.stages()[0], &[], 0.5, &mut rng).unwrap();
        assert_eq!(edge.group, "single");
        assert_eq!(edge.id, 0);
    }

    #[test]
    fn test_unseen_groups_sampled_uniformly() {
        let wf = workflow();
        let mut store = store(&wf);
        let mut rng = StdRng::seed_from_u64(7);
        let history = vec![StageChoice::new("single", 0)];

        let mut wide = 0;
        for _ in 0..400 {
            let group = choose_group(&mut store, &wf.stages()[1], &history, 0.5, &mut rng).unwrap();
            if group.name == "wide" {
                wide += 1;
            }
        }
        assert!((120..280).contains(&wide), "wide chosen {wide} times");
    }

    #[test]
    fn test_scored_group_preferred_when_hot() {
        let wf = workflow();
        let mut store = store(&wf);
        let history = vec![StageChoice::new("single", 0)];
        let stage = &wf.stages()[1];

        for (group, value, score) in [("wide", "10", 1.0), ("narrow", "1", 50.0)] {
            let params = &stage.groups().iter().find(|g| g.name == group).unwrap().parameters;
            let edge = store.add_edge(group, &[value.into()], params).unwrap();
            let id = store
                .add_configuration(&[history[0].clone(), StageChoice::new(group, edge)])
                .unwrap();
            store.update_configuration(id, score).unwrap();
        }

        let mut rng = StdRng::seed_from_u64(3);
        let mut narrow = 0;
        for _ in 0..200 {
            let group = choose_group(&mut store, stage, &history, 1.0, &mut rng).unwrap();
            if group.name == "narrow" {
                narrow += 1;
            }
        }
        assert!(narrow > 150, "narrow chosen {narrow} times");
    }

    #[test]
    fn test_value_search_uniform_without_history() {
        let wf = workflow();
        let mut store = store(&wf);
        let group = &wf.stages()[1].groups()[0];
        let mut rng = StdRng::seed_from_u64(11);

        let mut low = 0;
        for _ in 0..300 {
            let id = choose_value_id(&mut store, 1, &[], group, &group.parameters[0], 0.5, &mut rng)
                .unwrap();
            assert!(id <= 99);
            if id < 50 {
                low += 1;
            }
        }
        assert!((100..200).contains(&low), "low half chosen {low} times");
    }

    #[test]
    fn test_value_search_biased_toward_good_history() {
        let wf = workflow();
        let mut store = store(&wf);
        let group = &wf.stages()[1].groups()[0];
        let history = vec![StageChoice::new("single", 0)];

        for (value, score) in [("10", 1.0), ("90", 100.0)] {
            let edge = store.add_edge("wide", &[value.into()], &group.parameters).unwrap();
            let id = store
                .add_configuration(&[history[0].clone(), StageChoice::new("wide", edge)])
                .unwrap();
            store.update_configuration(id, score).unwrap();
        }

        let mut rng = StdRng::seed_from_u64(5);
        let (mut good, mut poor) = (0, 0);
        for _ in 0..1000 {
            let id = choose_value_id(
                &mut store,
                1,
                &history,
                group,
                &group.parameters[0],
                1.0,
                &mut rng,
            )
            .unwrap();
            match id {
                90 => good += 1,
                10 => poor += 1,
                _ => {}
            }
        }
        assert!(good > poor, "good {good}, poor {poor}");
        assert!(good >= 5, "good {good}");
    }

    #[test]
    fn test_selected_edge_is_persisted() {
        let wf = workflow();
        let mut store = store(&wf);
        let mut rng = StdRng::seed_from_u64(9);
        let history = vec![StageChoice::new("single", 0)];

        let edge = select_edge(&mut store, &wf.stages()[1], &history, 0.2, &mut rng).unwrap();
        assert!(edge.id > 0);
        let params = &wf.stages()[1]
            .groups()
            .iter()
            .find(|g| g.name == edge.group)
            .unwrap()
            .parameters;
        assert_eq!(store.add_edge(&edge.group, &edge.values, params).unwrap(), edge.id);
        assert_eq!(edge.command, edge.values[0]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_value_search_in_range(
            max in 1i64..300,
            seed in any::<u64>(),
            temperature in 0.0f64..=1.0,
            scores in proptest::collection::vec((0i64..300, -10.0f64..100.0), 0..12),
        ) {
            let param = Parameter::integer("v", 0, max, 1).unwrap();
            let group = EdgeGroup::new("g", vec![param.clone()], "$#v#$");
            let wf = Workflow::new(vec![vec![group.clone()]]).unwrap();
            let mut store = store(&wf);

            for (value, score) in scores {
                let value = (value % (max + 1)).to_string();
                let edge = store.add_edge("g", &[value], &group.parameters).unwrap();
                let id = store.add_configuration(&[StageChoice::new("g", edge)]).unwrap();
                store.update_configuration(id, score).unwrap();
            }

            let mut rng = StdRng::seed_from_u64(seed);
            let id = choose_value_id(&mut store, 0, &[], &group, &param, temperature, &mut rng).unwrap();
            prop_assert!(id <= param.max_id());
        }
    }
}
