use bookstore_queries::query::{
    CmpOp, Filter, Projection, apply_update, eval_filter, parse_filter, parse_pipeline,
    parse_projection, parse_update, project, run_pipeline,
};
use bson::doc;

#[test]
fn filter_eq_and_range() {
    let d = doc! {"title": "1984", "published_year": 1949, "tags": ["classic", "dystopia"]};
    assert!(eval_filter(&d, &Filter::Cmp { path: "published_year".into(), op: CmpOp::Eq, value: 1949.into() }));
    assert!(!eval_filter(&d, &Filter::Cmp { path: "published_year".into(), op: CmpOp::Gt, value: 1949.into() }));
    // array fields match on any element
    assert!(eval_filter(&d, &parse_filter(&doc! {"tags": "classic"}).unwrap()));
    // strings never satisfy numeric ranges
    assert!(!eval_filter(&d, &parse_filter(&doc! {"title": {"$gt": 0}}).unwrap()));
}

#[test]
fn logical_operators() {
    let d = doc! {"genre": "Fantasy", "price": 14.99, "in_stock": true};
    let f = parse_filter(&doc! {"$or": [{"genre": "Fiction"}, {"price": {"$lt": 15}}]}).unwrap();
    assert!(eval_filter(&d, &f));
    let f = parse_filter(&doc! {"price": {"$not": {"$gte": 10}}}).unwrap();
    assert!(!eval_filter(&d, &f));
    let f = parse_filter(&doc! {"genre": {"$in": ["Fantasy", "Romance"]}, "pages": {"$exists": false}}).unwrap();
    assert!(eval_filter(&d, &f));
    let f = parse_filter(&doc! {"$nor": [{"in_stock": true}]}).unwrap();
    assert!(!eval_filter(&d, &f));
}

#[test]
fn unknown_operators_are_rejected() {
    assert!(parse_filter(&doc! {"price": {"$near": 1}}).is_err());
    assert!(parse_update(&doc! {"price": 1}).is_err());
    assert!(parse_pipeline(&[doc! {"$lookup": {}}]).is_err());
    assert!(parse_pipeline(&[doc! {"$limit": 0}]).is_err());
}

#[test]
fn update_set_inc_unset() {
    let mut d = doc! {"title": "1984", "price": 10.99, "stock": 3, "info": {"visits": 1}, "unused": true};
    let upd = parse_update(&doc! {
        "$set": {"price": 15.99},
        "$inc": {"stock": 2, "info.visits": 1},
        "$unset": {"unused": ""},
    })
    .unwrap();
    assert!(apply_update(&mut d, &upd).unwrap());
    assert_eq!(d.get_f64("price").unwrap(), 15.99);
    assert_eq!(d.get_i32("stock").unwrap(), 5);
    assert_eq!(d.get_document("info").unwrap().get_i32("visits").unwrap(), 2);
    assert!(!d.contains_key("unused"));
}

#[test]
fn projection_include_and_exclude() {
    let d = doc! {"_id": 1, "title": "Dune", "author": "Frank Herbert", "price": 9.99};
    let p = parse_projection(&doc! {"title": 1, "price": 1}).unwrap();
    assert_eq!(project(&d, &p), doc! {"_id": 1, "title": "Dune", "price": 9.99});
    let p = Projection::Include { fields: vec!["title".into()], keep_id: false };
    assert_eq!(project(&d, &p), doc! {"title": "Dune"});
    let p = parse_projection(&doc! {"price": 0}).unwrap();
    assert_eq!(project(&d, &p), doc! {"_id": 1, "title": "Dune", "author": "Frank Herbert"});
    assert!(parse_projection(&doc! {"title": 1, "price": 0}).is_err());
}

#[test]
fn pipeline_match_group_sort() {
    let docs = vec![
        doc! {"genre": "Fiction", "price": 10.0},
        doc! {"genre": "Fantasy", "price": 20.0},
        doc! {"genre": "Fiction", "price": 14.0},
        doc! {"genre": "Romance", "price": 5.0},
    ];
    let stages = parse_pipeline(&[
        doc! {"$match": {"price": {"$gte": 10}}},
        doc! {"$group": {"_id": "$genre", "total": {"$sum": "$price"}, "cheapest": {"$min": "$price"}, "n": {"$count": {}}}},
        doc! {"$sort": {"total": -1}},
    ])
    .unwrap();
    let out = run_pipeline(docs, &stages).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].get_str("_id").unwrap(), "Fiction");
    assert_eq!(out[0].get_f64("total").unwrap(), 24.0);
    assert_eq!(out[0].get_f64("cheapest").unwrap(), 10.0);
    assert_eq!(out[1].get_str("_id").unwrap(), "Fantasy");
}
