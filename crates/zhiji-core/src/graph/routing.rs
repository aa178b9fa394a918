//! Edge selection. Every function here reads the state and nothing else.

use crate::intent::Route;
use crate::plan::is_simple_input;

use super::state::TurnState;
use super::Node;

/// The node that follows `node`, or `None` once the turn is complete.
pub fn next(node: Node, state: &TurnState) -> Option<Node> {
    let to = match node {
        Node::Preprocess => Node::CrisisCheck,
        Node::CrisisCheck => after_crisis(state),
        Node::IntentAnalysis => after_intent(state),
        Node::RagRetrieval | Node::WebSearch => Node::ContextBuild,
        Node::ContextBuild => after_context(state),
        Node::PlanUpdate => after_plan(state),
        Node::GuidedInquiry => after_inquiry(state),
        Node::PatternAnalysis => after_pattern(state),
        Node::AnalysisReport | Node::GenerateResponse => Node::PostprocessSave,
        Node::PostprocessSave => return None,
    };
    Some(to)
}

fn after_crisis(state: &TurnState) -> Node {
    if state.is_crisis() {
        Node::PostprocessSave
    } else {
        Node::IntentAnalysis
    }
}

fn after_intent(state: &TurnState) -> Node {
    match state.route {
        Route::Rag => Node::RagRetrieval,
        Route::WebSearch => Node::WebSearch,
        Route::Direct => Node::ContextBuild,
    }
}

fn after_context(state: &TurnState) -> Node {
    if is_simple_input(&state.user_input) {
        Node::GenerateResponse
    } else {
        Node::PlanUpdate
    }
}

fn after_plan(state: &TurnState) -> Node {
    if state.need_report {
        Node::AnalysisReport
    } else {
        Node::GuidedInquiry
    }
}

fn after_inquiry(state: &TurnState) -> Node {
    if state.need_pattern_analysis {
        Node::PatternAnalysis
    } else {
        Node::GenerateResponse
    }
}

fn after_pattern(state: &TurnState) -> Node {
    if state.need_report {
        Node::AnalysisReport
    } else {
        Node::GenerateResponse
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crisis::CrisisDetector;
    use crate::graph::state::TurnInput;

    fn state(message: &str) -> TurnState {
        TurnState::new(TurnInput::new("u1", message))
    }

    /// Follow edges from preprocess to the end.
    fn walk(state: &TurnState) -> Vec<Node> {
        let mut path = vec![Node::Preprocess];
        let mut node = Node::Preprocess;
        while let Some(to) = next(node, state) {
            path.push(to);
            node = to;
        }
        path
    }

    #[test]
    fn test_crisis_skips_to_save() {
        let mut s = state("我想死");
        s.crisis = Some(CrisisDetector::new().detect(&s.user_input));
        assert_eq!(
            walk(&s),
            vec![Node::Preprocess, Node::CrisisCheck, Node::PostprocessSave]
        );
    }

    #[test]
    fn test_simple_input_skips_plan() {
        let s = state("你好");
        assert_eq!(
            walk(&s),
            vec![
                Node::Preprocess,
                Node::CrisisCheck,
                Node::IntentAnalysis,
                Node::ContextBuild,
                Node::GenerateResponse,
                Node::PostprocessSave
            ]
        );
    }

    #[test]
    fn test_route_selects_retrieval_node() {
        let mut s = state("什么是认知行为疗法");
        s.route = Route::Rag;
        assert!(walk(&s).contains(&Node::RagRetrieval));
        s.route = Route::WebSearch;
        let path = walk(&s);
        assert!(path.contains(&Node::WebSearch));
        assert!(!path.contains(&Node::RagRetrieval));
    }

    #[test]
    fn test_report_request_goes_straight_to_report() {
        let mut s = state("生成报告");
        s.need_report = true;
        let path = walk(&s);
        assert_eq!(
            &path[path.len() - 3..],
            &[Node::PlanUpdate, Node::AnalysisReport, Node::PostprocessSave]
        );
        assert!(!path.contains(&Node::GenerateResponse));
    }

    #[test]
    fn test_pattern_then_response_or_report() {
        let mut s = state("最近总是失眠");
        s.need_pattern_analysis = true;
        let path = walk(&s);
        assert!(path.contains(&Node::PatternAnalysis));
        assert!(path.contains(&Node::GenerateResponse));
    }

    #[test]
    fn test_every_path_increases_rank() {
        let mut flags = Vec::new();
        for route in [Route::Rag, Route::WebSearch, Route::Direct] {
            for report in [false, true] {
                for pattern in [false, true] {
                    for message in ["你好", "我最近很焦虑"] {
                        flags.push((route, report, pattern, message));
                    }
                }
            }
        }
        for (route, report, pattern, message) in flags {
            let mut s = state(message);
            s.route = route;
            s.need_report = report;
            s.need_pattern_analysis = pattern;
            let path = walk(&s);
            assert!(
                path.windows(2).all(|w| w[0].rank() < w[1].rank()),
                "non-increasing path {path:?}"
            );
            assert_eq!(path.last(), Some(&Node::PostprocessSave));
        }
    }
}
