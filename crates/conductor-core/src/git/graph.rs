//! Lane layout for the commit log view.
//!
//! Commits arrive newest-first in parent order. Each commit occupies a lane;
//! its first parent inherits that lane, additional parents (merge sources)
//! are placed in the first free lane and rendered as curved edges. A lane is
//! freed as soon as no remaining commit is awaited in it. The layout is a
//! pure function of the commit order, so the same log always renders the
//! same picture.

use serde::Serialize;

use super::CommitInfo;

/// Lane assignment for one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphRow {
    pub sha: String,
    pub lane: usize,
    /// Edges drawn from this row toward its parents' lanes.
    pub edges: Vec<GraphEdge>,
}

/// One edge from a commit to a parent's lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphEdge {
    pub to_lane: usize,
    /// Straight for the first parent in the same lane, curved otherwise.
    pub curved: bool,
}

/// Assign lanes to a newest-first commit list.
pub fn layout(commits: &[CommitInfo]) -> Vec<GraphRow> {
    // Each slot holds the sha the lane is waiting to reach, or None if free.
    let mut lanes: Vec<Option<String>> = Vec::new();
    let mut rows = Vec::with_capacity(commits.len());

    for commit in commits {
        // Lanes currently waiting for this commit. The smallest index wins;
        // the rest collapse into it and are freed.
        let waiting: Vec<usize> = lanes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_deref() == Some(commit.sha.as_str()))
            .map(|(i, _)| i)
            .collect();

        let lane = match waiting.first() {
            Some(&first) => {
                for &extra in &waiting[1..] {
                    lanes[extra] = None;
                }
                first
            }
            None => claim_free_lane(&mut lanes),
        };

        let mut edges = Vec::new();
        let mut parents = commit.parents.iter();

        match parents.next() {
            Some(first_parent) => {
                // First parent continues in this lane.
                lanes[lane] = Some(first_parent.clone());
                edges.push(GraphEdge {
                    to_lane: lane,
                    curved: false,
                });
            }
            None => {
                // Root commit ends the lane.
                lanes[lane] = None;
            }
        }

        for parent in parents {
            // A merge source already awaited elsewhere joins that lane;
            // otherwise it opens the first free one.
            let to_lane = match lanes
                .iter()
                .position(|slot| slot.as_deref() == Some(parent.as_str()))
            {
                Some(existing) => existing,
                None => {
                    let new_lane = claim_free_lane(&mut lanes);
                    lanes[new_lane] = Some(parent.clone());
                    new_lane
                }
            };
            edges.push(GraphEdge {
                to_lane,
                curved: true,
            });
        }

        rows.push(GraphRow {
            sha: commit.sha.clone(),
            lane,
            edges,
        });

        // Trim trailing free slots so lane indices stay compact.
        while lanes.last().is_some_and(|slot| slot.is_none()) {
            lanes.pop();
        }
    }

    rows
}

fn claim_free_lane(lanes: &mut Vec<Option<String>>) -> usize {
    match lanes.iter().position(|slot| slot.is_none()) {
        Some(free) => free,
        None => {
            lanes.push(None);
            lanes.len() - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(sha: &str, parents: &[&str]) -> CommitInfo {
        CommitInfo {
            sha: sha.to_string(),
            short: sha.chars().take(7).collect(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            message: format!("commit {sha}"),
            author: "conductor".to_string(),
            time_ago: "just now".to_string(),
            refs: Vec::new(),
        }
    }

    #[test]
    fn linear_history_stays_in_lane_zero() {
        let commits = vec![commit("c", &["b"]), commit("b", &["a"]), commit("a", &[])];
        let rows = layout(&commits);
        assert!(rows.iter().all(|r| r.lane == 0));
        assert!(rows[0].edges.iter().all(|e| !e.curved));
    }

    #[test]
    fn merge_commit_opens_second_lane() {
        // m merges f into main; both sit on top of a.
        let commits = vec![
            commit("m", &["b", "f"]),
            commit("f", &["a"]),
            commit("b", &["a"]),
            commit("a", &[]),
        ];
        let rows = layout(&commits);

        assert_eq!(rows[0].lane, 0);
        // The merge edge to the second parent is curved into lane 1.
        assert_eq!(
            rows[0].edges,
            vec![
                GraphEdge { to_lane: 0, curved: false },
                GraphEdge { to_lane: 1, curved: true },
            ]
        );
        // f renders in the lane the merge reserved for it.
        assert_eq!(rows[1].lane, 1);
        // b is the first parent, back in lane 0.
        assert_eq!(rows[2].lane, 0);
        // a is reached by both lanes; it takes the smaller one.
        assert_eq!(rows[3].lane, 0);
    }

    #[test]
    fn lanes_are_freed_after_merge_base() {
        let commits = vec![
            commit("m", &["b", "f"]),
            commit("f", &["a"]),
            commit("b", &["a"]),
            commit("a", &["root"]),
            commit("root", &[]),
        ];
        let rows = layout(&commits);
        // After `a` collapses both lanes, root continues in lane 0.
        assert_eq!(rows[4].lane, 0);
    }

    #[test]
    fn unrelated_head_takes_first_free_lane() {
        // Two independent roots interleaved (e.g. orphan branch in the log).
        let commits = vec![
            commit("x2", &["x1"]),
            commit("y1", &[]),
            commit("x1", &[]),
        ];
        let rows = layout(&commits);
        assert_eq!(rows[0].lane, 0);
        assert_eq!(rows[1].lane, 1);
        assert_eq!(rows[2].lane, 0);
    }

    #[test]
    fn octopus_merge_gets_one_edge_per_parent() {
        let commits = vec![
            commit("m", &["a", "b", "c"]),
            commit("a", &[]),
            commit("b", &[]),
            commit("c", &[]),
        ];
        let rows = layout(&commits);
        assert_eq!(rows[0].edges.len(), 3);
        let lanes: Vec<usize> = rows[0].edges.iter().map(|e| e.to_lane).collect();
        assert_eq!(lanes, vec![0, 1, 2]);
    }

    #[test]
    fn layout_is_deterministic() {
        let commits = vec![
            commit("m", &["b", "f"]),
            commit("f", &["a"]),
            commit("b", &["a"]),
            commit("a", &[]),
        ];
        assert_eq!(layout(&commits), layout(&commits));
    }
}
