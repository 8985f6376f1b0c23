use bookstore_queries::query::{Order, SortSpec, compare_bson, compare_docs, eval_filter, parse_filter};
use bson::{Bson, doc};
use proptest::prelude::*;
use std::cmp::Ordering;

fn scalar() -> impl Strategy<Value = Bson> {
    prop_oneof![
        any::<i32>().prop_map(Bson::Int32),
        any::<i64>().prop_map(Bson::Int64),
        (-1.0e9f64..1.0e9).prop_map(Bson::Double),
        "[a-z]{0,6}".prop_map(Bson::String),
        any::<bool>().prop_map(Bson::Boolean),
        Just(Bson::Null),
    ]
}

proptest! {
    #[test]
    fn prop_compare_is_antisymmetric(a in scalar(), b in scalar()) {
        prop_assert_eq!(compare_bson(&a, &b), compare_bson(&b, &a).reverse());
    }

    #[test]
    fn prop_multi_key_sort_non_decreasing(v in proptest::collection::vec((any::<i32>(), any::<i32>()), 0..50)) {
        let mut docs: Vec<_> = v.iter().map(|(a, b)| doc! {"a": *a, "b": *b}).collect();
        let spec = vec![
            SortSpec { field: "a".into(), order: Order::Asc },
            SortSpec { field: "b".into(), order: Order::Desc },
        ];
        docs.sort_by(|x, y| compare_docs(x, y, &spec));
        for w in docs.windows(2) {
            let (a0, b0) = (w[0].get_i32("a").unwrap(), w[0].get_i32("b").unwrap());
            let (a1, b1) = (w[1].get_i32("a").unwrap(), w[1].get_i32("b").unwrap());
            prop_assert!(a0 < a1 || (a0 == a1 && b0 >= b1));
        }
    }

    #[test]
    fn prop_gt_and_lte_partition_numbers(x in any::<i32>(), pivot in any::<i32>()) {
        let d = doc! {"published_year": x};
        let gt = parse_filter(&doc! {"published_year": {"$gt": pivot}}).unwrap();
        let lte = parse_filter(&doc! {"published_year": {"$lte": pivot}}).unwrap();
        prop_assert!(eval_filter(&d, &gt) != eval_filter(&d, &lte));
        prop_assert_eq!(eval_filter(&d, &gt), x.cmp(&pivot) == Ordering::Greater);
    }

    #[test]
    fn prop_eq_filter_matches_own_value(v in scalar()) {
        let d = doc! {"field": v.clone()};
        let f = parse_filter(&doc! {"field": v}).unwrap();
        prop_assert!(eval_filter(&d, &f));
    }
}
