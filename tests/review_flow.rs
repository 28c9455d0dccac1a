mod common;

use chrono::Duration;
use common::*;
use skillpanel::review::ProposalSource;
use skillpanel::{AssessmentStatus, ErrorKind, Outcome, RecordType, ResponseInput};

#[test]
fn happy_path_reaches_archived() {
    let f = fixture(3);
    let id = submitted(&f);
    assert_eq!(f.service.get(&admin(), &id).unwrap().status, AssessmentStatus::Submitted);

    f.clock.advance(Duration::hours(1));
    // c1 averages (2 + 2 + 3) / 3 = 2.33 -> 2, every other category stays at 3.
    review_all(&f, &id, &reviewer(1), |c| if c == "c1" { 2 } else { 3 });
    review_all(&f, &id, &reviewer(2), |c| if c == "c1" { 2 } else { 3 });
    review_all(&f, &id, &reviewer(3), |_| 3);
    let a = f.service.get(&admin(), &id).unwrap();
    assert_eq!(a.status, AssessmentStatus::InReview);
    let opened_at = a.timestamps.in_review_at.unwrap();

    let report = f.service.completion(&admin(), &id).unwrap();
    assert_eq!((report.assigned, report.complete), (3, 3));
    assert!(report.quorum_met);

    f.clock.advance(Duration::hours(1));
    f.service.begin_consolidation(&reviewer(2), &id).unwrap();

    let board = f.service.proposal_board(&admin(), &id).unwrap();
    assert_eq!(board.len(), 5);
    assert_eq!(board[0].average.as_ref().unwrap().level_id, "ic-2");
    assert!(board.iter().skip(1).all(|b| b.average.as_ref().unwrap().level_id == "ic-3"));
    assert!(f.service.overall_score(&admin(), &id).unwrap().is_none());

    for category in CATEGORIES {
        for n in 1..=3 {
            assert!(f.service.approve_average(&reviewer(n), &id, category).unwrap());
        }
    }
    assert!(f.service.all_categories_approved(&admin(), &id).unwrap());

    f.service
        .draft_final_consolidation(&reviewer(1), &id, "Strong year, grow the c1 depth.")
        .unwrap();
    for n in 1..=3 {
        f.service.approve_final(&reviewer(n), &id).unwrap();
    }
    let reviewed = f.service.finish_consolidation(&reviewer(3), &id).unwrap();
    assert_eq!(reviewed.status, AssessmentStatus::Reviewed);

    let result = f.service.start_discussion(&admin(), &id).unwrap();
    // (1*2 + (2+3+4+5)*3) / 15 = 44 / 15
    assert!((result.overall_score - 44.0 / 15.0).abs() < 1e-12);
    assert_eq!(result.overall_level_number, 3);
    assert_eq!(result.categories[0].owner_delta, Some(-1));
    assert_eq!(result.categories[0].reviewers.len(), 3);
    let comment = f.service.read_text(&owner(), result.final_comment_ref.unwrap()).unwrap();
    assert_eq!(comment.text, "Strong year, grow the c1 depth.");
    assert_eq!(comment.record_type, RecordType::FinalComment);

    f.service.confirm_discussion(&reviewer(1), &id).unwrap();
    let archived = f.service.confirm_discussion(&owner(), &id).unwrap();
    assert_eq!(archived.status, AssessmentStatus::Archived);
    assert_eq!(archived.timestamps.in_review_at, Some(opened_at));
    assert!(archived.timestamps.archived_at.is_some());

    let view = f.service.discussion(&admin(), &id).unwrap();
    assert!(view.reviewer_confirmed && view.owner_confirmed);
    assert_eq!(view.result.overall_level_number, result.overall_level_number);
    assert_eq!(view.result.categories, result.categories);

    let actions = f.events.actions();
    for expected in [
        "assessment.create",
        "assessment.submit",
        "reviewer_response.save",
        "assessment.begin_consolidation",
        "approval.average.grant",
        "final.draft",
        "assessment.finish_consolidation",
        "assessment.start_discussion",
        "discussion.confirm",
    ] {
        assert!(actions.iter().any(|a| a == expected), "missing {expected}");
    }
    assert!(f.ledger.verify_chain().unwrap().records_checked >= 21);
}

#[test]
fn two_complete_reviewers_do_not_meet_quorum_of_three() {
    let f = fixture(3);
    let id = submitted(&f);
    review_all(&f, &id, &reviewer(1), |_| 3);
    review_all(&f, &id, &reviewer(2), |_| 4);
    // A third reviewer with partial coverage does not count.
    f.service
        .save_reviewer_response(&reviewer(3), &id, ResponseInput::new("c1", "ic", "ic-3"))
        .unwrap();

    let report = f.service.completion(&admin(), &id).unwrap();
    assert_eq!((report.assigned, report.complete), (3, 2));
    assert!(!report.quorum_met);
    let err = f.service.begin_consolidation(&reviewer(1), &id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);
    assert_eq!(f.service.get(&admin(), &id).unwrap().status, AssessmentStatus::InReview);

    review_all(&f, &id, &reviewer(3), |_| 5);
    let a = f.service.begin_consolidation(&reviewer(1), &id).unwrap();
    assert_eq!(a.status, AssessmentStatus::ReviewConsolidation);
}

#[test]
fn lower_quorum_is_honoured() {
    let f = fixture(2);
    let id = submitted(&f);
    review_all(&f, &id, &reviewer(1), |_| 3);
    review_all(&f, &id, &reviewer(2), |_| 4);
    assert!(f.service.completion(&admin(), &id).unwrap().quorum_met);
    f.service.begin_consolidation(&reviewer(2), &id).unwrap();
}

#[test]
fn override_resets_consensus_on_both_proposals() {
    let f = fixture(3);
    let id = consolidating(&f);
    f.service.approve_average(&reviewer(1), &id, "c3").unwrap();
    f.service.approve_average(&reviewer(2), &id, "c3").unwrap();
    assert_eq!(f.service.proposal_board(&admin(), &id).unwrap()[2].average_approvals, 2);

    f.service
        .set_override(
            &reviewer(3),
            &id,
            ResponseInput::new("c3", "mgmt", "m-4").with_justification("Runs the platform team."),
        )
        .unwrap();
    f.service.approve_override(&reviewer(1), &id, "c3").unwrap();

    // Replacing the override wipes everything again.
    f.service
        .set_override(&reviewer(2), &id, ResponseInput::new("c3", "mgmt", "m-3"))
        .unwrap();
    let board = f.service.proposal_board(&admin(), &id).unwrap();
    let c3 = &board[2];
    assert_eq!(c3.average_approvals, 0);
    assert_eq!(c3.override_approvals, 0);
    assert_eq!(c3.override_proposal.as_ref().unwrap().level_id, "m-3");
    assert!(c3.finalized.is_none());
}

#[test]
fn approved_override_wins_over_approved_average() {
    let f = fixture(3);
    let id = consolidating(&f);
    f.service
        .set_override(&reviewer(1), &id, ResponseInput::new("c2", "ic", "ic-5"))
        .unwrap();
    for n in 1..=3 {
        f.service.approve_average(&reviewer(n), &id, "c2").unwrap();
        f.service.approve_override(&reviewer(n), &id, "c2").unwrap();
    }
    let board = f.service.proposal_board(&admin(), &id).unwrap();
    let c2 = &board[1];
    let finalized = c2.finalized.as_ref().unwrap();
    assert_eq!(finalized.source, ProposalSource::Override);
    assert_eq!(finalized.level_number, 5);

    for category in ["c1", "c3", "c4", "c5"] {
        for n in 1..=3 {
            f.service.approve_average(&reviewer(n), &id, category).unwrap();
        }
    }
    // (1*3 + 2*5 + 3*3 + 4*3 + 5*3) / 15 = 49 / 15
    let score = f.service.overall_score(&admin(), &id).unwrap().unwrap();
    assert!((score.score - 49.0 / 15.0).abs() < 1e-12);
}

#[test]
fn removing_override_falls_back_to_average() {
    let f = fixture(3);
    let id = consolidating(&f);
    f.service
        .set_override(&reviewer(1), &id, ResponseInput::new("c4", "ic", "ic-1"))
        .unwrap();
    assert!(f.service.remove_override(&reviewer(1), &id, "c4").unwrap());
    assert!(!f.service.remove_override(&reviewer(1), &id, "c4").unwrap());
    for n in 1..=3 {
        f.service.approve_average(&reviewer(n), &id, "c4").unwrap();
    }
    let board = f.service.proposal_board(&admin(), &id).unwrap();
    let c4 = &board[3];
    assert_eq!(c4.finalized.as_ref().unwrap().source, ProposalSource::Average);
}

#[test]
fn repeated_approval_is_idempotent_and_revocable() {
    let f = fixture(3);
    let id = consolidating(&f);
    assert!(f.service.approve_average(&reviewer(1), &id, "c1").unwrap());
    assert!(!f.service.approve_average(&reviewer(1), &id, "c1").unwrap());
    assert_eq!(f.service.proposal_board(&admin(), &id).unwrap()[0].average_approvals, 1);

    assert!(f.service.revoke_average(&reviewer(1), &id, "c1").unwrap());
    assert_eq!(f.service.proposal_board(&admin(), &id).unwrap()[0].average_approvals, 0);
}

#[test]
fn final_consolidation_requires_every_category() {
    let f = fixture(3);
    let id = consolidating(&f);
    for n in 1..=3 {
        f.service.approve_average(&reviewer(n), &id, "c1").unwrap();
    }
    let err = f
        .service
        .draft_final_consolidation(&reviewer(1), &id, "Too early")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);
    assert!(err.to_string().contains("c2"));
    let err = f.service.finish_consolidation(&reviewer(1), &id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);
}

#[test]
fn redrafting_final_comment_clears_its_approvals() {
    let f = fixture(3);
    let id = consolidating(&f);
    for category in CATEGORIES {
        for n in 1..=3 {
            f.service.approve_average(&reviewer(n), &id, category).unwrap();
        }
    }
    f.service.draft_final_consolidation(&reviewer(1), &id, "v1").unwrap();
    f.service.approve_final(&reviewer(1), &id).unwrap();
    f.service.approve_final(&reviewer(2), &id).unwrap();
    f.service.draft_final_consolidation(&reviewer(2), &id, "v2").unwrap();

    let draft = f.service.final_consolidation(&admin(), &id).unwrap().unwrap();
    assert!(draft.approvals.is_empty());
    let text = f.service.read_text(&reviewer(1), draft.comment_ref.unwrap()).unwrap();
    assert_eq!(text.text, "v2");
}

#[test]
fn regenerate_is_rejected_for_approved_categories() {
    let f = fixture(3);
    let id = consolidating(&f);
    f.service.approve_average(&reviewer(1), &id, "c1").unwrap();

    // A late correction on an untouched category.
    f.service
        .save_reviewer_response(&reviewer(2), &id, ResponseInput::new("c5", "ic", "ic-5"))
        .unwrap();
    let err = f
        .service
        .save_reviewer_response(&reviewer(2), &id, ResponseInput::new("c1", "ic", "ic-5"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);

    let err = f.service.regenerate_proposals(&reviewer(1), &id, &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);
    assert!(err.to_string().contains("c1"));

    let regenerated = f.service.regenerate_proposals(&reviewer(1), &id, &["c5"]).unwrap();
    // (3 + 5 + 3) / 3 = 3.67 -> 4
    assert_eq!(regenerated[0].level_id, "ic-4");
    assert_eq!(f.service.proposal_board(&admin(), &id).unwrap()[4].average.as_ref().unwrap().level_number, 4);
}

#[test]
fn close_can_be_reverted_within_window_only() {
    let f = fixture(3);
    let id = submitted(&f);
    f.service.close(&owner(), &id).unwrap();
    f.clock.advance(Duration::hours(23));
    let reverted = f.service.revert(&owner(), &id).unwrap();
    assert_eq!(reverted.status, AssessmentStatus::Submitted);

    f.service.close(&admin(), &id).unwrap();
    f.clock.advance(Duration::hours(25));
    let err = f.service.revert(&owner(), &id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);
    assert_eq!(f.service.get(&admin(), &id).unwrap().status, AssessmentStatus::Closed);

    // Frozen: nothing else goes through either.
    let err = f.service.open_review(&reviewer(1), &id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);
}

#[test]
fn one_active_assessment_per_catalog_and_owner() {
    let f = fixture(3);
    let first = f.service.create_assessment(&owner(), CATALOG).unwrap();
    let err = f.service.create_assessment(&owner(), CATALOG).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);

    f.service.close(&owner(), &first.id).unwrap();
    let second = f.service.create_assessment(&owner(), CATALOG).unwrap();
    // Reverting the first would make two active ones.
    let err = f.service.revert(&owner(), &first.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);
    assert_eq!(f.service.list_for_owner(&owner(), "alice").unwrap().len(), 2);
    assert_ne!(first.id, second.id);
}

#[test]
fn oversized_revert_window_fails_close_cleanly() {
    let f = fixture(3);
    let service = skillpanel::ReviewService::new(
        f.db.clone(),
        f.ledger.clone(),
        std::sync::Arc::new(skillpanel::StaticCatalogs::with(catalog())),
        skillpanel::ReviewConfig {
            quorum: 3,
            revert_window_hours: i64::MAX,
        },
    )
    .with_clock(f.clock.clone());
    let id = submitted(&f);

    let err = service.close(&owner(), &id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(f.service.get(&owner(), &id).unwrap().status, AssessmentStatus::Submitted);
}

#[test]
fn submit_needs_every_required_category() {
    let f = fixture(3);
    let a = f.service.create_assessment(&owner(), CATALOG).unwrap();
    for category in ["c1", "c2", "c3", "c4"] {
        f.service
            .save_response(&owner(), &a.id, ResponseInput::new(category, "ic", "ic-2"))
            .unwrap();
    }
    let err = f.service.submit(&owner(), &a.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);
    assert!(err.to_string().contains("c5"));

    f.service
        .save_response(&owner(), &a.id, ResponseInput::new("c5", "ic", "ic-2"))
        .unwrap();
    assert!(f.service.delete_response(&owner(), &a.id, "c5").unwrap());
    assert!(f.service.submit(&owner(), &a.id).is_err());
    f.service
        .save_response(&owner(), &a.id, ResponseInput::new("c5", "ic", "ic-2"))
        .unwrap();
    f.service.submit(&owner(), &a.id).unwrap();

    let err = f
        .service
        .save_response(&owner(), &a.id, ResponseInput::new("c5", "ic", "ic-4"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);
}

#[test]
fn role_gates_are_enforced() {
    let f = fixture(3);
    let id = submitted(&f);

    let err = f
        .service
        .save_reviewer_response(
            &skillpanel::Actor::reviewer("alice"),
            &id,
            ResponseInput::new("c1", "ic", "ic-5"),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let err = f.service.assign_reviewer(&reviewer(1), &id, "rev-9").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let err = f.service.assign_reviewer(&admin(), &id, "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(f.service.assign_reviewer(&admin(), &id, "rev-9").unwrap());
    assert_eq!(f.service.reviewers(&admin(), &id).unwrap(), vec!["rev-9".to_string()]);

    let err = f.service.submit(&reviewer(1), &id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let events = f.events.events();
    let last = events.last().unwrap();
    assert_eq!(last.action, "assessment.submit");
    assert!(matches!(last.outcome, Outcome::Failed(_)));
}

#[test]
fn ledger_text_is_readable_only_by_parties_to_the_assessment() {
    let f = fixture(3);
    let id = submitted(&f);
    let stranger = skillpanel::Actor::owner("mallory");
    let responses = f.service.responses(&owner(), &id).unwrap();
    let reference = responses[0].justification_ref.unwrap();

    let err = f.service.read_text(&stranger, reference).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(f.service.get(&stranger, &id).unwrap_err().kind(), ErrorKind::Forbidden);
    assert_eq!(
        f.service.responses(&stranger, &id).unwrap_err().kind(),
        ErrorKind::Forbidden
    );

    // Reviewers see it once they sit on the panel.
    let err = f.service.read_text(&reviewer(1), reference).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    f.service.open_review(&reviewer(1), &id).unwrap();
    let entry = f.service.read_text(&reviewer(1), reference).unwrap();
    assert_eq!(entry.text, "I own c1 end to end.");

    assert_eq!(f.service.read_text(&owner(), reference).unwrap().text, entry.text);
    assert_eq!(f.service.read_text(&admin(), reference).unwrap().text, entry.text);

    let events = f.events.events();
    let denied = events
        .iter()
        .find(|e| e.action == "ledger.read" && !e.succeeded())
        .unwrap();
    assert_eq!(denied.actor_id, "mallory");
}

#[test]
fn unreferenced_ledger_record_is_not_readable() {
    let f = fixture(3);
    let loose = f
        .ledger
        .append("alice", RecordType::DiscussionNote, "written outside any assessment")
        .unwrap();
    let err = f.service.read_text(&admin(), loose).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn level_must_belong_to_chosen_path() {
    let f = fixture(3);
    let a = f.service.create_assessment(&owner(), CATALOG).unwrap();
    let err = f
        .service
        .save_response(&owner(), &a.id, ResponseInput::new("c1", "mgmt", "ic-2"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn rejected_write_leaves_no_ledger_record() {
    let f = fixture(3);
    let id = consolidating(&f);
    let before = f.ledger.verify_chain().unwrap();

    let err = f
        .service
        .set_override(
            &reviewer(1),
            &id,
            ResponseInput::new("c1", "ic", "ic-99").with_justification("never stored"),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let after = f.ledger.verify_chain().unwrap();
    assert_eq!(before, after);
    assert!(f.service.proposal_board(&admin(), &id).unwrap()[0].override_proposal.is_none());
}

#[test]
fn owner_cannot_confirm_before_a_reviewer() {
    let f = fixture(3);
    let id = consolidating(&f);
    for category in CATEGORIES {
        for n in 1..=3 {
            f.service.approve_average(&reviewer(n), &id, category).unwrap();
        }
    }
    f.service.draft_final_consolidation(&reviewer(1), &id, "Done").unwrap();
    for n in 1..=3 {
        f.service.approve_final(&reviewer(n), &id).unwrap();
    }
    f.service.finish_consolidation(&reviewer(1), &id).unwrap();
    f.service.start_discussion(&reviewer(1), &id).unwrap();

    let err = f.service.confirm_discussion(&owner(), &id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);

    f.service
        .add_discussion_note(&owner(), &id, "Agreed on the c1 plan.")
        .unwrap();
    f.service.confirm_discussion(&reviewer(2), &id).unwrap();
    let err = f.service.confirm_discussion(&reviewer(2), &id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Guard);

    f.service.confirm_discussion(&owner(), &id).unwrap();
    let view = f.service.discussion(&admin(), &id).unwrap();
    assert_eq!(view.confirmations.len(), 2);
    assert_eq!(view.notes.len(), 1);
    let note = f.service.read_text(&reviewer(2), view.notes[0].note_ref.unwrap()).unwrap();
    assert_eq!(note.text, "Agreed on the c1 plan.");

    // Archived is terminal.
    assert_eq!(f.service.close(&owner(), &id).unwrap_err().kind(), ErrorKind::Guard);
}
