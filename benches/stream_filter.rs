use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use beaconloc::config::{BiasPrior, FilterConfig, MotionProperty, PosePrior};
use beaconloc::data::{Beacon, Location, Sample};
use beaconloc::localization::beacon_filter::BeaconFilterChain;
use beaconloc::localization::initializer::StatusInitializer;
use beaconloc::localization::resampler::GridResampler;
use beaconloc::localization::stream_filter::StreamParticleFilter;
use beaconloc::map::{Building, CoordinateSystem, FloorMap, Raster};
use beaconloc::models::motion::{PoseRandomWalker, PoseRandomWalkerInBuilding};
use beaconloc::models::observation::StubModel;

fn build_filter(n_states: usize) -> StreamParticleFilter {
    let raster = Raster::from_fn(100, 100, |_, _| [255, 0, 0, 0]);
    let floor = FloorMap::new(raster, CoordinateSystem::new(1.0, 1.0, 1.0, 0.0, 0.0, 0.0));
    let mut floors = BTreeMap::new();
    floors.insert(0, floor);
    let building = Arc::new(Building::new(floors).unwrap());

    let samples: Vec<Sample> = (0..50)
        .map(|i| Sample {
            timestamp_ms: i as u64,
            location: Location::new(5.0 + (i % 10) as f64 * 9.0, 5.0 + (i / 10) as f64 * 9.0, 0.0, 0.0),
            beacons: vec![],
        })
        .collect();
    let initializer = Arc::new(
        StatusInitializer::new(
            building.clone(),
            &samples,
            PosePrior::default(),
            BiasPrior::default(),
        )
        .unwrap(),
    );
    let system_model = PoseRandomWalkerInBuilding::new(
        PoseRandomWalker::new(PosePrior::default(), BiasPrior::default(), 100.0),
        building,
        MotionProperty::default(),
    );
    StreamParticleFilter::new(
        FilterConfig {
            n_states,
            seed: 1,
            ..FilterConfig::default()
        },
        Box::new(system_model),
        Arc::new(StubModel {
            center: Location::new(50.0, 50.0, 0.0, 0.0),
            scale: 0.01,
        }),
        Box::new(GridResampler::default()),
        initializer,
        None,
        BeaconFilterChain::standard(10),
        Box::new(beaconloc::sensors::OrientationMeterAverage::default()),
        Box::new(beaconloc::sensors::PedometerWalkingState::default()),
    )
    .unwrap()
}

fn bench_update_beacons(c: &mut Criterion) {
    let mut filter = build_filter(1000);
    let scan = vec![Beacon::new(1, 1, -60.0), Beacon::new(1, 2, -70.0)];
    let mut ts = 0u64;
    c.bench_function("update_beacons_1000_particles", |b| {
        b.iter(|| {
            ts += 1000;
            filter.update_beacons(ts, &scan).unwrap()
        })
    });
}

criterion_group!(benches, bench_update_beacons);
criterion_main!(benches);
