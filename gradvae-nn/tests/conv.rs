use candle::{test_device, DType, Device, IndexOp, Module, Result, Tensor};
use gradvae_nn::{Conv3d, Conv3dConfig};

/// Direct 3D convolution on host vectors, used as the reference.
fn naive_conv3d(
    input: &[f32],
    (c_in, d, h, w): (usize, usize, usize, usize),
    weight: &[f32],
    (c_out, k): (usize, usize),
    padding: usize,
    stride: usize,
) -> (Vec<f32>, (usize, usize, usize)) {
    let od = (d + 2 * padding - k) / stride + 1;
    let oh = (h + 2 * padding - k) / stride + 1;
    let ow = (w + 2 * padding - k) / stride + 1;
    let mut out = vec![0f32; c_out * od * oh * ow];
    for co in 0..c_out {
        for z in 0..od {
            for y in 0..oh {
                for x in 0..ow {
                    let mut acc = 0f32;
                    for ci in 0..c_in {
                        for kz in 0..k {
                            for ky in 0..k {
                                for kx in 0..k {
                                    let iz = (z * stride + kz) as isize - padding as isize;
                                    let iy = (y * stride + ky) as isize - padding as isize;
                                    let ix = (x * stride + kx) as isize - padding as isize;
                                    if iz < 0 || iy < 0 || ix < 0 {
                                        continue;
                                    }
                                    let (iz, iy, ix) = (iz as usize, iy as usize, ix as usize);
                                    if iz >= d || iy >= h || ix >= w {
                                        continue;
                                    }
                                    let iv = input[((ci * d + iz) * h + iy) * w + ix];
                                    let wv = weight[(((co * c_in + ci) * k + kz) * k + ky) * k + kx];
                                    acc += iv * wv;
                                }
                            }
                        }
                    }
                    out[((co * od + z) * oh + y) * ow + x] = acc;
                }
            }
        }
    }
    (out, (od, oh, ow))
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0f32, f32::max)
}

/// Padded k3 convolution against the host reference.
fn conv3d_matches_reference(dev: &Device) -> Result<()> {
    let (c_in, d, h, w) = (2, 4, 5, 3);
    let (c_out, k) = (3, 3);
    let input: Vec<f32> = (0..c_in * d * h * w).map(|i| ((i % 7) as f32) * 0.25 - 0.5).collect();
    let weight: Vec<f32> = (0..c_out * c_in * k * k * k)
        .map(|i| ((i % 5) as f32) * 0.1 - 0.2)
        .collect();
    let xs = Tensor::from_vec(input.clone(), (1, c_in, d, h, w), dev)?;
    let ws = Tensor::from_vec(weight.clone(), (c_out, c_in, k, k, k), dev)?;

    for (padding, stride) in [(1, 1), (0, 1), (1, 2)] {
        let cfg = Conv3dConfig {
            padding,
            stride,
            ..Default::default()
        };
        let conv = Conv3d::new(ws.clone(), None, cfg);
        let ys = conv.forward(&xs)?;
        let (expected, (od, oh, ow)) =
            naive_conv3d(&input, (c_in, d, h, w), &weight, (c_out, k), padding, stride);
        assert_eq!(ys.dims(), [1, c_out, od, oh, ow]);
        let got = ys.flatten_all()?.to_vec1::<f32>()?;
        assert!(
            max_abs_diff(&got, &expected) < 1e-4,
            "padding={padding} stride={stride}"
        );
    }
    Ok(())
}

/// Bias is added per output channel.
fn conv3d_bias(dev: &Device) -> Result<()> {
    let input = Tensor::arange(0f32, 128., dev)?.reshape((1, 2, 4, 4, 4))?;
    let weight = Tensor::arange(0f32, 48., dev)?.reshape((3, 2, 2, 2, 2))?;
    let bias = Tensor::arange(0f32, 3., dev)?;

    let conv = Conv3d::new(weight.clone(), Some(bias), Conv3dConfig::default());
    let output = conv.forward(&input)?;
    assert_eq!(output.dims(), [1, 3, 3, 3, 3]);

    let no_bias_conv = Conv3d::new(weight, None, Conv3dConfig::default());
    let no_bias_output = no_bias_conv.forward(&input)?;

    let diff = (output.i((.., 1, .., .., ..))? - no_bias_output.i((.., 1, .., .., ..))?)?;
    let diff_sum = diff.sum_all()?.to_scalar::<f32>()?;
    // bias[1] = 1, broadcasted over 27 elements (3x3x3)
    assert!((diff_sum - 27.0).abs() < 1e-3);
    Ok(())
}

/// Gradients flow to both the input and the kernel.
fn conv3d_backward(dev: &Device) -> Result<()> {
    let xs = candle::Var::from_tensor(&Tensor::ones((1, 1, 3, 3, 3), DType::F32, dev)?)?;
    let ws = candle::Var::from_tensor(&Tensor::ones((1, 1, 3, 3, 3), DType::F32, dev)?)?;
    let cfg = Conv3dConfig {
        padding: 1,
        ..Default::default()
    };
    let ys = gradvae_nn::conv::conv3d_forward(xs.as_tensor(), ws.as_tensor(), &cfg)?;
    let loss = ys.sum_all()?;
    let grads = loss.backward()?;

    let gw = grads.get(ws.as_tensor()).expect("kernel grad");
    assert_eq!(gw.dims(), [1, 1, 3, 3, 3]);
    // The centre tap sees every input voxel once per output voxel.
    let centre = gw.i((0, 0, 1, 1, 1))?.to_scalar::<f32>()?;
    assert!((centre - 27.0).abs() < 1e-4);
    // A corner tap only overlaps a 2x2x2 block of the input.
    let corner = gw.i((0, 0, 0, 0, 0))?.to_scalar::<f32>()?;
    assert!((corner - 8.0).abs() < 1e-4);

    let gx = grads.get(xs.as_tensor()).expect("input grad");
    assert_eq!(gx.dims(), [1, 1, 3, 3, 3]);
    Ok(())
}

/// Strided backward when height and width leave different remainders.
fn conv3d_backward_mixed_parity(dev: &Device) -> Result<()> {
    let (c_in, d, h, w) = (2, 7, 6, 5);
    let (c_out, k) = (3, 3);
    let input: Vec<f32> = (0..c_in * d * h * w).map(|i| ((i % 11) as f32) * 0.1 - 0.5).collect();
    let xs = candle::Var::from_tensor(&Tensor::from_vec(input.clone(), (1, c_in, d, h, w), dev)?)?;
    let ws = candle::Var::from_tensor(&Tensor::ones((c_out, c_in, k, k, k), DType::F32, dev)?)?;
    let cfg = Conv3dConfig {
        stride: 2,
        ..Default::default()
    };
    let ys = gradvae_nn::conv::conv3d_forward(xs.as_tensor(), ws.as_tensor(), &cfg)?;
    let (expected, (od, oh, ow)) =
        naive_conv3d(&input, (c_in, d, h, w), &vec![1f32; c_out * c_in * 27], (c_out, k), 0, 2);
    assert_eq!(ys.dims(), [1, c_out, od, oh, ow]);
    assert!(max_abs_diff(&ys.flatten_all()?.to_vec1::<f32>()?, &expected) < 1e-4);

    let grads = ys.sum_all()?.backward()?;
    let gx = grads.get(xs.as_tensor()).expect("input grad");
    assert_eq!(gx.dims(), [1, c_in, d, h, w]);
    // With an all-ones kernel the gradient counts the windows covering a voxel,
    // once per output channel. Coverage along each axis for k3 s2:
    let cover_d = [1f32, 1., 2., 1., 2., 1., 1.];
    let cover_h = [1f32, 1., 2., 1., 1., 0.];
    let cover_w = [1f32, 1., 2., 1., 1.];
    let gx = gx.i((0, 1))?.to_vec3::<f32>()?;
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let expected = c_out as f32 * cover_d[z] * cover_h[y] * cover_w[x];
                assert!((gx[z][y][x] - expected).abs() < 1e-4, "({z}, {y}, {x})");
            }
        }
    }

    let gw = grads.get(ws.as_tensor()).expect("kernel grad");
    assert_eq!(gw.dims(), [c_out, c_in, k, k, k]);
    Ok(())
}

/// Weights and bias are registered under the module prefix.
fn conv3d_var_builder(dev: &Device) -> Result<()> {
    use candle_nn::VarMap;

    let var_map = VarMap::new();
    let vb = candle_nn::VarBuilder::from_varmap(&var_map, DType::F32, dev);

    let conv = gradvae_nn::conv3d(2, 3, 3, Conv3dConfig::default(), vb.pp("conv"))?;
    assert_eq!(conv.weight().dims(), [3, 2, 3, 3, 3]);
    assert_eq!(conv.bias().map(|b| b.dims().to_vec()), Some(vec![3]));

    let no_bias = gradvae_nn::conv3d_no_bias(2, 3, 1, Conv3dConfig::default(), vb.pp("pw"))?;
    assert!(no_bias.bias().is_none());

    let data = var_map.data().lock().unwrap();
    assert!(data.contains_key("conv.weight"));
    assert!(data.contains_key("conv.bias"));
    assert!(data.contains_key("pw.weight"));
    assert!(!data.contains_key("pw.bias"));
    Ok(())
}

test_device!(
    conv3d_matches_reference,
    conv3d_matches_reference_cpu,
    conv3d_matches_reference_gpu,
    conv3d_matches_reference_metal
);
test_device!(conv3d_bias, conv3d_bias_cpu, conv3d_bias_gpu, conv3d_bias_metal);
test_device!(
    conv3d_backward,
    conv3d_backward_cpu,
    conv3d_backward_gpu,
    conv3d_backward_metal
);
test_device!(
    conv3d_backward_mixed_parity,
    conv3d_backward_mixed_parity_cpu,
    conv3d_backward_mixed_parity_gpu,
    conv3d_backward_mixed_parity_metal
);
test_device!(
    conv3d_var_builder,
    conv3d_var_builder_cpu,
    conv3d_var_builder_gpu,
    conv3d_var_builder_metal
);
