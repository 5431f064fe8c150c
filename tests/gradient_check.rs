//! Gradient checking tests.
//!
//! Every hand-written backward pass is compared against central finite
//! differences: (f(x+ε) - f(x-ε)) / 2ε.
//!
//! The retardance chain is quadratic in Δn once composed with the MSE data
//! terms, so central differences are exact there up to f32 rounding.

#[cfg(test)]
mod tests {
    use nalgebra::{Vector2, Vector3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use biref_recon::config::OpticalConfig;
    use biref_recon::core::optic_axis::random_unit_vector;
    use biref_recon::core::{ActiveParameterSet, AxisParametrization, BirefringentVolume, VolumeShape, VolumeView, VoxelMask};
    use biref_recon::diff::axis_grad::{normalize_grad, planar_grad};
    use biref_recon::diff::retardance_grad::{
        ret_azim_from_vector, ret_azim_from_vector_grad, voxel_retardance_vector,
        voxel_retardance_vector_grad,
    };
    use biref_recon::diff::VolumeGrads;
    use biref_recon::optim::loss::{intensity_loss_and_grad, vector_loss_and_grad};
    use biref_recon::optim::{DataFidelity, ImplicitField, LossEngine, MeasuredImages, Regularizer};
    use biref_recon::render::{ForwardModel, OutputMode, RayGeometry, WeakBirefringenceTracer};

    fn rel_err(a: f32, b: f32) -> f32 {
        let denom = a.abs().max(b.abs()).max(1e-6);
        (a - b).abs() / denom
    }

    fn assert_close(num: f32, ana: f32, rel: f32, abs: f32, what: &str) {
        let abs_err = (num - ana).abs();
        assert!(
            rel_err(num, ana) < rel || abs_err < abs,
            "{what}: num={num} ana={ana} abs_err={abs_err} rel_err={}",
            rel_err(num, ana)
        );
    }

    #[test]
    fn test_voxel_retardance_vector_gradient() {
        let mut rng = StdRng::seed_from_u64(0xB1_4EF);
        for _ in 0..100 {
            let scale = rng.gen_range(0.5..3.0);
            let dn = rng.gen_range(-0.5..0.5);
            let axis = random_unit_vector(&mut rng);
            let d_r = Vector2::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
            let f = |dn: f32, a: &Vector3<f32>| d_r.dot(&voxel_retardance_vector(scale, dn, a)) as f64;

            let (d_dn, d_axis) = voxel_retardance_vector_grad(scale, dn, &axis, &d_r);

            let eps = 1e-3f32;
            let num = ((f(dn + eps, &axis) - f(dn - eps, &axis)) / (2.0 * eps as f64)) as f32;
            assert_close(num, d_dn, 1e-3, 1e-4, "d_dn");

            for k in 0..3 {
                let mut plus = axis;
                let mut minus = axis;
                plus[k] += eps;
                minus[k] -= eps;
                let num = ((f(dn, &plus) - f(dn, &minus)) / (2.0 * eps as f64)) as f32;
                assert_close(num, d_axis[k], 1e-3, 1e-4, "d_axis");
            }
        }
    }

    #[test]
    fn test_retardance_azimuth_gradient() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut checked = 0;
        while checked < 100 {
            let r = Vector2::new(rng.gen_range(-1.0f32..1.0), rng.gen_range(-1.0f32..1.0));
            // Stay clear of the origin and of the azimuth wrap at R_y = 0.
            if r.y.abs() < 0.2 || r.norm() < 0.3 {
                continue;
            }
            checked += 1;
            let (d_ret, d_azim) = (rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
            let f = |v: &Vector2<f32>| {
                let (ret, azim) = ret_azim_from_vector(v);
                (d_ret * ret + d_azim * azim) as f64
            };
            let ana = ret_azim_from_vector_grad(&r, d_ret, d_azim);

            let eps = 1e-3f32;
            for k in 0..2 {
                let mut plus = r;
                let mut minus = r;
                plus[k] += eps;
                minus[k] -= eps;
                let num = ((f(&plus) - f(&minus)) / (2.0 * eps as f64)) as f32;
                assert_close(num, ana[k], 2e-3, 2e-4, "d_R");
            }
        }
    }

    #[test]
    fn test_vector_loss_gradient() {
        let mut rng = StdRng::seed_from_u64(11);
        let n = 16;
        let pred_ret: Vec<f32> = (0..n).map(|_| rng.gen_range(0.1..1.0)).collect();
        let pred_azim: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..3.0)).collect();
        let meas_ret: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..1.0)).collect();
        let meas_azim: Vec<f32> = (0..n).map(|_| rng.gen_range(0.0..3.0)).collect();
        let scale = 0.7;

        let (_, d_ret, d_azim) = vector_loss_and_grad(&pred_ret, &pred_azim, &meas_ret, &meas_azim, scale);
        let loss = |r: &[f32], a: &[f32]| vector_loss_and_grad(r, a, &meas_ret, &meas_azim, scale).0 as f64;

        let eps = 1e-3f32;
        for i in 0..n {
            let mut plus = pred_ret.clone();
            let mut minus = pred_ret.clone();
            plus[i] += eps;
            minus[i] -= eps;
            let num = ((loss(&plus, &pred_azim) - loss(&minus, &pred_azim)) / (2.0 * eps as f64)) as f32;
            assert_close(num, d_ret[i], 2e-3, 1e-4, "d_ret");

            let mut plus = pred_azim.clone();
            let mut minus = pred_azim.clone();
            plus[i] += eps;
            minus[i] -= eps;
            let num = ((loss(&pred_ret, &plus) - loss(&pred_ret, &minus)) / (2.0 * eps as f64)) as f32;
            assert_close(num, d_azim[i], 2e-3, 1e-4, "d_azim");
        }
    }

    #[test]
    fn test_intensity_loss_gradient() {
        let mut rng = StdRng::seed_from_u64(12);
        let pred: Vec<Vec<f32>> = (0..4).map(|_| (0..9).map(|_| rng.gen_range(0.0..1.0)).collect()).collect();
        let meas: Vec<Vec<f32>> = (0..4).map(|_| (0..9).map(|_| rng.gen_range(0.0..1.0)).collect()).collect();
        let (_, grads) = intensity_loss_and_grad(&pred, &meas);

        let eps = 1e-3f32;
        for f in 0..4 {
            for i in 0..9 {
                let mut plus = pred.clone();
                let mut minus = pred.clone();
                plus[f][i] += eps;
                minus[f][i] -= eps;
                let num = ((intensity_loss_and_grad(&plus, &meas).0 as f64
                    - intensity_loss_and_grad(&minus, &meas).0 as f64)
                    / (2.0 * eps as f64)) as f32;
                assert_close(num, grads[f][i], 2e-3, 1e-4, "d_intensity");
            }
        }
    }

    fn random_params(rng: &mut StdRng) -> ActiveParameterSet {
        let shape = VolumeShape::new(2, 3, 3);
        let vol = BirefringentVolume::random(shape, [1.0; 3], (-0.5, 0.5), rng);
        let mask = VoxelMask::from_indices(shape.voxel_count(), &[0, 1, 2, 4, 5, 9, 10, 13, 17]);
        ActiveParameterSet::derive(&vol, &mask, AxisParametrization::Full).unwrap()
    }

    #[test]
    fn test_regularizer_gradients() {
        let mut rng = StdRng::seed_from_u64(21);
        let params = random_params(&mut rng);
        let regs = [
            Regularizer::L1Birefringence,
            Regularizer::L2Birefringence,
            Regularizer::NegativePenalty,
            Regularizer::PositivePenalty,
            Regularizer::TotalVariation,
            Regularizer::CosineSimilarityNeighbors,
        ];
        // Random Δn in (-0.5, 0.5) sit far from the kinks at 0 and at
        // equal neighbors relative to this step.
        let eps = 1e-4f32;

        for reg in regs {
            let mut grads = VolumeGrads::zeros(params.len());
            reg.value_and_grad(&params, 1.0, &mut grads);

            for i in 0..params.len() {
                let mut plus = params.clone();
                let mut minus = params.clone();
                plus.birefringence[i] += eps;
                minus.birefringence[i] -= eps;
                let num = ((reg.value(&plus) as f64 - reg.value(&minus) as f64) / (2.0 * eps as f64)) as f32;
                assert_close(num, grads.birefringence[i], 5e-3, 5e-3, reg.name());

                for k in 0..3 {
                    let mut plus = params.clone();
                    let mut minus = params.clone();
                    plus.optic_axis[i][k] += eps;
                    minus.optic_axis[i][k] -= eps;
                    let num =
                        ((reg.value(&plus) as f64 - reg.value(&minus) as f64) / (2.0 * eps as f64)) as f32;
                    assert_close(num, grads.optic_axis[i][k], 5e-3, 5e-3, reg.name());
                }
            }
        }
    }

    #[test]
    fn test_planar_and_normalize_gradients() {
        let mut rng = StdRng::seed_from_u64(31);
        let eps = 1e-3f32;
        for _ in 0..100 {
            let d = Vector3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));

            // Planar: axis = (sqrt(1 - |p|²), p_y, p_x), kept away from the equator.
            let p = Vector2::new(rng.gen_range(-0.5f32..0.5), rng.gen_range(-0.5f32..0.5));
            let axis_of = |p: &Vector2<f32>| Vector3::new((1.0 - p.norm_squared()).sqrt(), p.x, p.y);
            let ana = planar_grad(&p, &d);
            for k in 0..2 {
                let mut plus = p;
                let mut minus = p;
                plus[k] += eps;
                minus[k] -= eps;
                let num = ((d.dot(&axis_of(&plus)) as f64 - d.dot(&axis_of(&minus)) as f64) / (2.0 * eps as f64)) as f32;
                assert_close(num, ana[k], 2e-3, 2e-4, "planar");
            }

            // Normalization of a raw vector of moderate length.
            let raw = random_unit_vector(&mut rng) * rng.gen_range(0.5f32..2.0);
            let ana = normalize_grad(&raw, &d);
            for k in 0..3 {
                let mut plus = raw;
                let mut minus = raw;
                plus[k] += eps;
                minus[k] -= eps;
                let num = ((d.dot(&plus.normalize()) as f64 - d.dot(&minus.normalize()) as f64)
                    / (2.0 * eps as f64)) as f32;
                assert_close(num, ana[k], 5e-3, 5e-4, "normalize");
            }
        }
    }

    fn small_tracer() -> WeakBirefringenceTracer {
        let optics = OpticalConfig {
            volume_shape: [3, 5, 5],
            voxel_size_um: [1.0; 3],
            pixels_per_ml: 5,
            ..Default::default()
        };
        WeakBirefringenceTracer::new(RayGeometry::compute(&optics).unwrap(), optics.wavelength, &optics.analyzer_angles_deg)
    }

    fn check_tracer_backward(fidelity: DataFidelity, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let tracer = small_tracer();
        let shape = tracer.geometry.volume_shape;
        let gt = BirefringentVolume::random(shape, [1.0; 3], (0.0, 0.01), &mut rng);
        let mut measured = MeasuredImages::from_images(
            tracer.forward(VolumeView::Full(&gt), OutputMode::RetardanceAzimuth).unwrap(),
            tracer.image_shape(),
        );
        if fidelity == DataFidelity::Intensity {
            if let biref_recon::render::ImageSet::Intensity(frames) =
                tracer.forward(VolumeView::Full(&gt), OutputMode::IntensityStack).unwrap()
            {
                measured.intensity = Some(frames);
            }
        }
        let engine = LossEngine::new(fidelity, 0.0, Vec::new(), false, measured).unwrap();

        let guess = BirefringentVolume::random(shape, [1.0; 3], (0.002, 0.012), &mut rng);
        let params = ActiveParameterSet::derive(&guess, &VoxelMask::reachable(&tracer.geometry), AxisParametrization::Full).unwrap();

        let loss = |p: &ActiveParameterSet| {
            let images = tracer.forward(VolumeView::Active(p), engine.output_mode()).unwrap();
            engine.compute(&images, p).unwrap().total as f64
        };

        let images = tracer.forward(VolumeView::Active(&params), engine.output_mode()).unwrap();
        let mut grads = VolumeGrads::zeros(params.len());
        let (_, d_images) = engine.compute_with_grads(&images, &params, &mut grads).unwrap();
        tracer.backward(VolumeView::Active(&params), &d_images, &mut grads).unwrap();

        let max_dn = grads.birefringence.iter().fold(0.0f32, |m, g| m.max(g.abs()));
        let eps = 1e-3f32;
        for i in (0..params.len()).step_by(3) {
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus.birefringence[i] += eps;
            minus.birefringence[i] -= eps;
            let num = ((loss(&plus) - loss(&minus)) / (2.0 * eps as f64)) as f32;
            assert_close(num, grads.birefringence[i], 1e-2, 1e-3 * max_dn.max(1e-3), "tracer d_dn");
        }

        let max_axis = grads.optic_axis.iter().fold(0.0f32, |m, g| m.max(g.amax()));
        let eps = 1e-3f32;
        for i in (0..params.len()).step_by(5) {
            for k in 1..3 {
                let mut plus = params.clone();
                let mut minus = params.clone();
                plus.optic_axis[i][k] += eps;
                minus.optic_axis[i][k] -= eps;
                let num = ((loss(&plus) - loss(&minus)) / (2.0 * eps as f64)) as f32;
                assert_close(num, grads.optic_axis[i][k], 2e-2, 2e-3 * max_axis.max(1e-3), "tracer d_axis");
            }
        }
    }

    #[test]
    fn test_tracer_backward_vector_fidelity() {
        check_tracer_backward(DataFidelity::Vector, 41);
    }

    #[test]
    fn test_tracer_backward_intensity_fidelity() {
        check_tracer_backward(DataFidelity::Intensity, 42);
    }

    #[test]
    fn test_implicit_field_head_gradient() {
        let mut rng = StdRng::seed_from_u64(51);
        let field = ImplicitField::new(8, 2, &mut rng);
        let shape = VolumeShape::new(2, 3, 3);
        let base = BirefringentVolume::zeros(shape, [1.0; 3]);
        let mut params = ActiveParameterSet::derive(&base, &VoxelMask::all(shape.voxel_count()), AxisParametrization::Full).unwrap();

        // Linear functional of the predicted parameters.
        let mut upstream = VolumeGrads::zeros(params.len());
        for i in 0..params.len() {
            upstream.birefringence[i] = rng.gen_range(-1.0..1.0);
            upstream.optic_axis[i] = Vector3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
        }
        let objective = |f: &ImplicitField, p: &mut ActiveParameterSet| {
            f.predict_into(p);
            let mut total = 0.0f64;
            for i in 0..p.len() {
                total += (upstream.birefringence[i] * p.birefringence[i]) as f64;
                total += upstream.optic_axis[i].dot(&p.optic_axis[i]) as f64;
            }
            total
        };

        field.predict_into(&mut params);
        let grads = field.backward(&params, &upstream);

        // No ReLU after the head, but the axis outputs are normalized onto the
        // sphere, so the step has to stay small against that curvature.
        let eps = 1e-3f32;
        let head = field.layers.len() - 1;
        for j in 0..field.layers[head].weights.len() {
            let mut plus = field.clone();
            let mut minus = field.clone();
            plus.layers[head].weights[j] += eps;
            minus.layers[head].weights[j] -= eps;
            let num = ((objective(&plus, &mut params) - objective(&minus, &mut params)) / (2.0 * eps as f64)) as f32;
            assert_close(num, grads.layers[head].weights[j], 1e-2, 2e-3, "field head weight");
        }
        for j in 0..field.layers[head].bias.len() {
            let mut plus = field.clone();
            let mut minus = field.clone();
            plus.layers[head].bias[j] += eps;
            minus.layers[head].bias[j] -= eps;
            let num = ((objective(&plus, &mut params) - objective(&minus, &mut params)) / (2.0 * eps as f64)) as f32;
            assert_close(num, grads.layers[head].bias[j], 1e-2, 2e-3, "field head bias");
        }
    }
}
