use proptest::prelude::*;
use vellum_labels::{LabelChanges, LabelList, LabelStatements, Operation, OpsStatements};

fn labels() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(-5i64..60, 0..12)
}

proptest! {
    #[test]
    fn changing_then_apply_reaches_target(a in labels(), b in labels()) {
        let from = LabelList::new(a);
        let to = LabelList::new(b);
        let changes = LabelChanges::changing(&from, &to);
        prop_assert_eq!(changes.apply(&from), to);
    }

    #[test]
    fn construction_is_idempotent(a in labels()) {
        let once = LabelList::new(a);
        let twice = LabelList::new(once.as_slice().to_vec());
        prop_assert_eq!(&twice, &once);
        prop_assert!(once.as_slice().windows(2).all(|w| w[0] < w[1]));
        prop_assert!(once.iter().all(|l| l > 0));
    }

    #[test]
    fn ops_allowed_matches_set_definition(allow in labels(), deny in labels(), l in labels()) {
        let allow = LabelList::new(allow);
        let deny = LabelList::new(deny);
        let list = LabelList::new(l);
        let s = LabelStatements::Ops(
            OpsStatements::new().statement(Operation::Update, allow.clone(), deny.clone()),
        );
        let expected = !allow.is_empty() && list.intersects(&allow) && !list.intersects(&deny);
        prop_assert_eq!(s.is_allowed(Operation::Update, &list), expected);
        if allow.is_empty() {
            prop_assert!(!s.is_allowed(Operation::Update, &list));
        }
    }

    #[test]
    fn and_or_are_pointwise(a1 in labels(), a2 in labels(), l in labels()) {
        let s1 = LabelStatements::Ops(OpsStatements::new().statement(Operation::Read, LabelList::new(a1), LabelList::empty()));
        let s2 = LabelStatements::Ops(OpsStatements::new().statement(Operation::Read, LabelList::new(a2), LabelList::empty()));
        let list = LabelList::new(l);
        let x = s1.is_allowed(Operation::Read, &list);
        let y = s2.is_allowed(Operation::Read, &list);
        prop_assert_eq!(LabelStatements::and(s1.clone(), s2.clone()).is_allowed(Operation::Read, &list), x && y);
        prop_assert_eq!(LabelStatements::or(s1, s2).is_allowed(Operation::Read, &list), x || y);
    }
}
