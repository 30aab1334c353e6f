use chrono::{DateTime, Duration, TimeZone, Utc};
use opera_disp_tms::core::spanning_set::{find_needed_granules, restrict_to_spanning_set, SelectionStrategy};
use opera_disp_tms::io::catalog::StaticGranules;
use opera_disp_tms::{DispError, Granule, OrbitPass};

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 1, d, 0, 0, 0).unwrap()
}

fn granule(reference: u32, secondary: u32) -> Granule {
    Granule::new(
        format!("OPERA_L3_DISP-S1_F00001_{:02}_{:02}", reference, secondary),
        1,
        OrbitPass::Ascending,
        "",
        "",
        day(reference),
        day(secondary),
        day(secondary),
    )
    .expect("valid granule")
}

#[test]
fn test_restrict_to_spanning_set_chain() {
    let mut granules = vec![granule(1, 4), granule(4, 7), granule(7, 10)];
    let result = restrict_to_spanning_set(&granules).expect("chain is connected");
    assert_eq!(result, granules);

    granules.push(granule(7, 13));
    let result = restrict_to_spanning_set(&granules).expect("chain is connected");
    assert_eq!(result, vec![granules[0].clone(), granules[1].clone(), granules[3].clone()]);
}

#[test]
fn test_restrict_to_spanning_set_disconnected() {
    let granules = vec![granule(1, 4), granule(7, 10), granule(7, 13)];
    let result = restrict_to_spanning_set(&granules);
    assert!(matches!(result, Err(DispError::DisconnectedNetwork(_))));
}

#[test]
fn test_restrict_to_spanning_set_stalled_walk() {
    // Newest granule spans less than a day, so nothing reaches further back
    let short = Granule::new(
        "OPERA_L3_DISP-S1_F00001_09_09",
        1,
        OrbitPass::Ascending,
        "",
        "",
        day(9),
        day(9) + Duration::hours(20),
        day(10),
    )
    .expect("valid granule");
    let result = restrict_to_spanning_set(&[granule(1, 5), short]);
    assert!(matches!(result, Err(DispError::DisconnectedNetwork(_))));
}

#[test]
fn test_restrict_to_spanning_set_unsorted_input() {
    let granules = vec![granule(4, 7), granule(1, 4), granule(1, 2)];
    let result = restrict_to_spanning_set(&granules).expect("chain is connected");
    assert_eq!(result, vec![granule(1, 4), granule(4, 7)]);
}

#[test]
fn test_find_needed_granules() {
    let granules = vec![granule(1, 3), granule(1, 5), granule(5, 8), granule(8, 11)];
    let source = StaticGranules::new(granules.clone());

    let needed = find_needed_granules(&source, 1, day(1), day(9), SelectionStrategy::All).expect("search");
    assert_eq!(needed.len(), 3);
    assert_eq!(needed, granules[..3].to_vec());

    let needed = find_needed_granules(&source, 1, day(1), day(9), SelectionStrategy::Spanning).expect("search");
    assert_eq!(needed.len(), 2);
    assert_eq!(needed, granules[1..3].to_vec());
}

#[test]
fn test_find_needed_granules_empty_window() {
    let source = StaticGranules::new(vec![granule(1, 3), granule(1, 5)]);
    let needed = find_needed_granules(&source, 1, day(20), day(25), SelectionStrategy::Spanning).expect("search");
    assert!(needed.is_empty());

    let other_frame = find_needed_granules(&source, 2, day(1), day(25), SelectionStrategy::All).expect("search");
    assert!(other_frame.is_empty());
}
