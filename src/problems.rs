//! Compiled-in example problems.
//!
//! These generators are illustrative: real deployments build a [`Problem`]
//! from their own topology data. Both follow the same conventions: app
//! node names are zero-padded for stable lexicographic ordering, and
//! hardware positions are plotting hints only.

use crate::problem::Problem;

/// An application cycle of `app_nodes` placed on a hardware cycle of
/// `hw_nodes`, every hardware edge carrying the same `weight`.
///
/// Hardware nodes are positioned along a line for plotting.
pub fn ring(app_nodes: usize, hw_nodes: usize, weight: f32, p_max: usize) -> Problem {
    let mut problem = Problem::new("ring");
    problem.p_max = p_max;

    for i in 0..app_nodes {
        problem.add_app_node(format!("a{i}"));
    }
    for i in 0..app_nodes {
        problem.add_app_edge(i, (i + 1) % app_nodes);
    }

    for i in 0..hw_nodes {
        problem.add_hw_node_at(format!("h{i}"), i as f32, 0.0);
    }
    for i in 0..hw_nodes {
        problem.add_hw_edge(i, (i + 1) % hw_nodes, weight);
    }

    problem
}

/// Weight of a hardware edge between mailboxes on the same board.
pub const INTER_MAILBOX_WEIGHT: f32 = 100.0;

/// Weight of a hardware edge between mailboxes on neighbouring boards.
pub const INTER_BOARD_WEIGHT: f32 = 800.0;

/// A 2-D application grid (non-toroidal, simple graph) on a hierarchical
/// board/mailbox hardware graph.
///
/// The application is an `app_diameter` x `app_diameter` grid with
/// 4-neighbour connectivity. The hardware is a grid of boards, each a grid
/// of mailboxes; one hardware node per mailbox, positioned at its global
/// grid coordinate. Adjacent mailboxes on the same board are connected with
/// weight [`INTER_MAILBOX_WEIGHT`]; adjacent mailboxes across a board
/// boundary with weight [`INTER_BOARD_WEIGHT`].
pub fn grid(
    app_diameter: usize,
    boards_outer: usize,
    boards_inner: usize,
    mboxes_outer: usize,
    mboxes_inner: usize,
    p_max: usize,
) -> Problem {
    let mut problem = Problem::new("mailbox_grid");
    problem.p_max = p_max;

    // Application nodes, zero-padded names.
    let width = app_diameter.to_string().len();
    for outer in 0..app_diameter {
        for inner in 0..app_diameter {
            problem.add_app_node(format!("A_{outer:0width$}_{inner:0width$}"));
        }
    }

    // 4-neighbour grid edges; each edge added once, towards increasing
    // coordinates, so the bounds checks stay trivial.
    let a_index = |outer: usize, inner: usize| outer * app_diameter + inner;
    for outer in 0..app_diameter {
        for inner in 0..app_diameter {
            if outer + 1 < app_diameter {
                problem.add_app_edge(a_index(outer, inner), a_index(outer + 1, inner));
            }
            if inner + 1 < app_diameter {
                problem.add_app_edge(a_index(outer, inner), a_index(outer, inner + 1));
            }
        }
    }

    // One hardware node per mailbox, laid out on a global grid.
    let hw_outer = boards_outer * mboxes_outer;
    let hw_inner = boards_inner * mboxes_inner;
    for outer in 0..hw_outer {
        for inner in 0..hw_inner {
            let board_outer = outer / mboxes_outer;
            let board_inner = inner / mboxes_inner;
            let mbox_outer = outer % mboxes_outer;
            let mbox_inner = inner % mboxes_inner;
            problem.add_hw_node_at(
                format!("B_{board_outer}_{board_inner}_M_{mbox_outer}_{mbox_inner}"),
                outer as f32,
                inner as f32,
            );
        }
    }

    let h_index = |outer: usize, inner: usize| outer * hw_inner + inner;
    let edge_weight = |same_board: bool| {
        if same_board {
            INTER_MAILBOX_WEIGHT
        } else {
            INTER_BOARD_WEIGHT
        }
    };
    for outer in 0..hw_outer {
        for inner in 0..hw_inner {
            if outer + 1 < hw_outer {
                let same_board = outer / mboxes_outer == (outer + 1) / mboxes_outer;
                problem.add_hw_edge(
                    h_index(outer, inner),
                    h_index(outer + 1, inner),
                    edge_weight(same_board),
                );
            }
            if inner + 1 < hw_inner {
                let same_board = inner / mboxes_inner == (inner + 1) / mboxes_inner;
                problem.add_hw_edge(
                    h_index(outer, inner),
                    h_index(outer, inner + 1),
                    edge_weight(same_board),
                );
            }
        }
    }

    problem
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_has_symmetric_neighbours() {
        let problem = ring(8, 4, 2.0, 3);
        assert_eq!(problem.node_as.len(), 8);
        assert_eq!(problem.node_hs.len(), 4);
        assert_eq!(problem.edge_hs.len(), 4);
        for (a, node) in problem.node_as.iter().enumerate() {
            assert_eq!(node.neighbours.len(), 2, "every ring node has degree 2");
            for &b in &node.neighbours {
                assert!(
                    problem.node_as[b].neighbours.contains(&a),
                    "neighbour lists must be symmetric"
                );
            }
        }
    }

    #[test]
    fn grid_sizes_and_degrees() {
        let problem = grid(4, 2, 2, 2, 2, 4);
        assert_eq!(problem.node_as.len(), 16);
        assert_eq!(problem.node_hs.len(), 16);
        // Corner nodes have degree 2, edge nodes 3, interior 4.
        let degrees: Vec<usize> = problem.node_as.iter().map(|a| a.neighbours.len()).collect();
        assert_eq!(degrees.iter().filter(|&&d| d == 2).count(), 4);
        assert_eq!(degrees.iter().filter(|&&d| d == 3).count(), 8);
        assert_eq!(degrees.iter().filter(|&&d| d == 4).count(), 4);
    }

    #[test]
    fn grid_weights_follow_board_boundaries() {
        let problem = grid(2, 2, 1, 2, 2, 4);
        // Hardware: 4 x 2 mailboxes, board boundary between outer 1 and 2.
        let mut saw_mailbox = false;
        let mut saw_board = false;
        for &(from, to, weight) in &problem.edge_hs {
            let from_outer = from / 2;
            let to_outer = to / 2;
            if (from_outer < 2) == (to_outer < 2) {
                assert!((weight - INTER_MAILBOX_WEIGHT).abs() < f32::EPSILON);
                saw_mailbox = true;
            } else {
                assert!((weight - INTER_BOARD_WEIGHT).abs() < f32::EPSILON);
                saw_board = true;
            }
        }
        assert!(saw_mailbox && saw_board);
    }

    #[test]
    fn grid_names_are_zero_padded() {
        let problem = grid(12, 1, 1, 2, 2, 4);
        assert_eq!(problem.node_as[0].name, "A_00_00");
        assert_eq!(problem.node_as.last().unwrap().name, "A_11_11");
        assert_eq!(problem.node_hs[0].name, "B_0_0_M_0_0");
    }

    #[test]
    fn grid_positions_match_global_coordinates() {
        let problem = grid(2, 2, 2, 2, 2, 4);
        for node_h in &problem.node_hs {
            assert!(node_h.pos_horiz >= 0.0);
            assert!(node_h.pos_verti >= 0.0);
        }
        assert!((problem.node_hs[0].pos_horiz - 0.0).abs() < f32::EPSILON);
        let last = problem.node_hs.last().unwrap();
        assert!((last.pos_horiz - 3.0).abs() < f32::EPSILON);
        assert!((last.pos_verti - 3.0).abs() < f32::EPSILON);
    }
}
