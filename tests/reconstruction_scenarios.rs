//! End-to-end scenarios for masking, loss, schedule and the full loop.

use approx::assert_relative_eq;
use biref_recon::config::{
    IterationConfig, OpticalConfig, ReconstructionSettings, RegularizationWeight, ScheduleSettings,
};
use biref_recon::core::{
    ActiveParameterSet, AxisParametrization, BirefringentVolume, VolumeArena, VolumeShape, VolumeView, VoxelMask,
    INACTIVE,
};
use biref_recon::io::{load_volume, LOSS_CSV};
use biref_recon::optim::reconstructor::FINAL_VOLUME_FILE;
use biref_recon::optim::{
    prepare_model, DataFidelity, LearningRateSchedule, LossEngine, MeasuredImages, Reconstructor, Regularizer,
};
use biref_recon::render::{ForwardModel, ImageSet, OutputMode, RayGeometry, WeakBirefringenceTracer};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;
use tempfile::tempdir;

fn optics() -> OpticalConfig {
    OpticalConfig {
        volume_shape: [3, 7, 7],
        voxel_size_um: [1.0; 3],
        pixels_per_ml: 7,
        ..Default::default()
    }
}

fn shell_measurement(optics: &OpticalConfig) -> (BirefringentVolume, MeasuredImages) {
    let shape = VolumeShape::from_array(optics.volume_shape);
    let gt = BirefringentVolume::ellipsoid_shell(shape, optics.voxel_size_um, [1.0, 2.5, 2.5], 0.3, 0.01);
    let tracer = WeakBirefringenceTracer::new(
        RayGeometry::compute(optics).unwrap(),
        optics.wavelength,
        &optics.analyzer_angles_deg,
    );
    let images = tracer.forward(VolumeView::Full(&gt), OutputMode::RetardanceAzimuth).unwrap();
    (gt, MeasuredImages::from_images(images, tracer.image_shape()))
}

#[test]
fn test_three_of_ten_active_mapping() {
    let vol = BirefringentVolume::zeros(VolumeShape::new(1, 2, 5), [1.0; 3]);
    let mask = VoxelMask::from_indices(10, &[1, 4, 7]);
    let params = ActiveParameterSet::derive(&vol, &mask, AxisParametrization::Full).unwrap();

    assert_eq!(params.birefringence.len(), 3);
    assert_eq!(params.optic_axis.len(), 3);
    let table = params.position_table();
    assert_eq!((table[1], table[4], table[7]), (0, 1, 2));
    for voxel in [0, 2, 3, 5, 6, 8, 9] {
        assert_eq!(table[voxel], INACTIVE);
    }
}

#[test]
fn test_mask_construction_is_idempotent() {
    let optics = optics();
    let (_, measured) = shell_measurement(&optics);
    for all_rays in [false, true] {
        let settings = ReconstructionSettings::from_config(&IterationConfig {
            mla_rays_at_once: all_rays,
            from_simulation: true,
            ..Default::default()
        })
        .unwrap();
        let a = prepare_model(&optics, &settings, &measured, tempdir().unwrap().path()).unwrap();
        let b = prepare_model(&optics, &settings, &measured, tempdir().unwrap().path()).unwrap();
        assert_eq!(a.mask.count_active(), b.mask.count_active());
        assert_eq!(a.mask, b.mask);
        assert!(a.mask.count_active() > 0);
    }
}

#[test]
fn test_scatter_reproduces_last_written_values() {
    let mut rng = StdRng::seed_from_u64(17);
    let vol = BirefringentVolume::random(VolumeShape::new(2, 3, 4), [1.0; 3], (0.0, 0.01), &mut rng);
    let mask = VoxelMask::from_indices(vol.voxel_count(), &[0, 5, 6, 11, 23]);
    let mut arena = VolumeArena::new(vol).activate(&mask, AxisParametrization::Full, false).unwrap();

    let written: Vec<f32> = (0..5).map(|_| rng.gen_range(-0.02..0.02)).collect();
    arena.params_mut().unwrap().birefringence.copy_from_slice(&written);
    let indices = arena.params().unwrap().indices().to_vec();
    let axes = arena.params().unwrap().optic_axis.clone();

    let out = arena.scatter().unwrap().into_volume().unwrap();
    for (pos, &voxel) in indices.iter().enumerate() {
        assert_eq!(out.birefringence[voxel], written[pos]);
        assert_eq!(out.optic_axis[voxel], axes[pos]);
    }
    assert_eq!(out.birefringence[1], 0.0);
}

#[test]
fn test_vector_data_term_is_pi_periodic_in_azimuth() {
    let mut rng = StdRng::seed_from_u64(23);
    let n = 12;
    let measured = MeasuredImages {
        image_shape: (3, 4),
        retardance: (0..n).map(|_| rng.gen_range(0.0..1.0)).collect(),
        azimuth: (0..n).map(|_| rng.gen_range(0.0..PI)).collect(),
        intensity: None,
    };
    let engine = LossEngine::new(DataFidelity::Vector, 1.0, Vec::new(), false, measured).unwrap();
    let retardance: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..1.0)).collect();
    let azimuth: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..PI)).collect();
    let shifted: Vec<f32> = azimuth.iter().map(|a| a + PI).collect();

    let (a, _) = engine
        .data_term_and_grad(&ImageSet::RetardanceAzimuth {
            retardance: retardance.clone(),
            azimuth,
        })
        .unwrap();
    let (b, _) = engine
        .data_term_and_grad(&ImageSet::RetardanceAzimuth {
            retardance,
            azimuth: shifted,
        })
        .unwrap();
    assert_relative_eq!(a, b, epsilon = 1e-5);
}

#[test]
fn test_all_zero_images_give_zero_data_term() {
    let measured = MeasuredImages {
        image_shape: (2, 3),
        retardance: vec![0.0; 6],
        azimuth: vec![0.0; 6],
        intensity: None,
    };
    // Normalization must not divide by the zero maximum.
    let engine = LossEngine::new(DataFidelity::Vector, 1.0, Vec::new(), true, measured).unwrap();
    let (data, grad) = engine
        .data_term_and_grad(&ImageSet::RetardanceAzimuth {
            retardance: vec![0.0; 6],
            azimuth: vec![0.0; 6],
        })
        .unwrap();
    assert_eq!(data, 0.0);
    assert_eq!(grad.zeros_like(), grad);
}

fn schedule_settings() -> ScheduleSettings {
    ScheduleSettings {
        warmup_epochs: 10,
        warmup_start_proportion: 0.1,
        plateau_patience: 10,
        plateau_threshold: 1e-4,
        plateau_factor: 0.5,
        min_lr: 1e-6,
    }
}

#[test]
fn test_warmup_ramps_to_nominal_rate() {
    let schedule = LearningRateSchedule::new(&schedule_settings(), vec![1e-3, 1e-4]);
    assert_relative_eq!(schedule.rates_for(1)[0], 1e-4, epsilon = 1e-10);
    assert_relative_eq!(schedule.rates_for(1)[1], 1e-5, epsilon = 1e-11);
    assert_relative_eq!(schedule.rates_for(10)[0], 1e-3, epsilon = 1e-9);
    assert_relative_eq!(schedule.rates_for(11)[0], 1e-3, epsilon = 1e-9);
}

#[test]
fn test_plateau_halves_once_on_eleventh_identical_loss() {
    let mut schedule = LearningRateSchedule::new(&schedule_settings(), vec![1e-3, 1e-4]);
    let reductions: Vec<usize> = (1..=12)
        .filter(|&call| schedule.observe(call, 0.5))
        .collect();
    assert_eq!(reductions, vec![11]);
    assert_relative_eq!(schedule.base_rates()[0], 5e-4, epsilon = 1e-10);
    assert_relative_eq!(schedule.base_rates()[1], 5e-5, epsilon = 1e-11);
}

#[test]
fn test_full_reconstruction_run() {
    let optics = optics();
    let (gt, measured) = shell_measurement(&optics);
    let dir = tempdir().unwrap();
    let config = IterationConfig {
        optimizer: "Adam".into(),
        n_epochs: 6,
        save_freq: 3,
        seed: Some(1),
        regularization_weight: RegularizationWeight::List(vec![0.5, 9.0]),
        regularization_fcns: vec![
            ("l1_bir_active".into(), 0.1),
            ("cosine_similarity_neighbors".into(), 0.01),
        ],
        ..Default::default()
    };
    let settings = ReconstructionSettings::from_config(&config).unwrap();
    assert_eq!(settings.regularizers[1].0, Regularizer::CosineSimilarityNeighbors);

    let prepared = prepare_model(&optics, &settings, &measured, dir.path()).unwrap();
    let mask = prepared.mask.clone();
    let recon = Reconstructor::from_prepared(settings, prepared, measured, dir.path()).unwrap();

    let mut rng = StdRng::seed_from_u64(2);
    let initial = BirefringentVolume::random(gt.shape, [1.0; 3], (0.0, 0.01), &mut rng);
    let out = recon.run(&initial).unwrap();

    assert_eq!(out.history.len(), 6);
    for (i, state) in out.history.iter().enumerate() {
        assert_eq!(state.epoch, i + 1);
        assert!(state.total.is_finite());
        assert_relative_eq!(state.total, state.data_term + 0.5 * state.reg_term, epsilon = 1e-6);
        assert_eq!(state.reg_values.len(), 2);
    }

    for voxel in 0..gt.voxel_count() {
        if mask.is_active(voxel) {
            assert_relative_eq!(out.volume.optic_axis[voxel].norm(), 1.0, epsilon = 1e-5);
        } else {
            assert_eq!(out.volume.birefringence[voxel], 0.0);
            assert_eq!(out.volume.optic_axis[voxel], Vector3::zeros());
        }
    }

    let (saved, description) = load_volume(dir.path().join(FINAL_VOLUME_FILE)).unwrap();
    assert_eq!(saved, out.volume);
    assert!(description.contains("6 iterations"));
    let csv = std::fs::read_to_string(dir.path().join(LOSS_CSV)).unwrap();
    assert_eq!(csv.lines().count(), 7);
    assert!(dir.path().join("volume_ep_0003.bvol").exists());
    assert!(dir.path().join("optim_ep_0006.png").exists());
}
