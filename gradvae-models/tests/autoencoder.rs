use candle::{DType, Device, Module, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use gradvae_models::models::autoencoder::{
    AutoencoderConfig, AutoencoderKL, DecoderOnly, DiagonalGaussian, Encoder, EncoderOnly,
};

fn tiny_config() -> AutoencoderConfig {
    AutoencoderConfig {
        n_channels: 4,
        ch_mult: vec![1, 2],
        num_res_blocks: 1,
        norm_num_groups: 2,
        z_channels: 2,
        embed_dim: 2,
        ..AutoencoderConfig::mri()
    }
}

fn build(config: &AutoencoderConfig) -> Result<(VarMap, AutoencoderKL)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = AutoencoderKL::new(config, vb)?;
    Ok((varmap, model))
}

#[test]
fn encode_decode_shapes() -> Result<()> {
    let config = tiny_config();
    let (_varmap, model) = build(&config)?;
    let x = Tensor::randn(0f32, 1., (2, 1, 8, 8, 6), &Device::Cpu)?;

    let z = model.encode(&x)?;
    assert_eq!(z.dims(), [2, 2, 4, 4, 3]);
    let (e, d, h, w) = config.latent_shape(8, 8, 6);
    assert_eq!(z.dims()[1..], [e, d, h, w]);

    let recon = model.decode(&z)?;
    assert_eq!(recon.dims(), x.dims());
    assert_eq!(model.reconstruct_ldm_outputs(&z)?.dims(), x.dims());
    Ok(())
}

#[test]
fn parameter_names_follow_block_lists() -> Result<()> {
    let config = tiny_config();
    let (varmap, _model) = build(&config)?;
    let data = varmap.data().lock().unwrap();
    // encoder: conv_in, res(4->4), down, res(4->8), norm, conv_out
    for key in [
        "encoder.blocks.0.weight",
        "encoder.blocks.1.norm1.weight",
        "encoder.blocks.2.conv.weight",
        "encoder.blocks.3.nin_shortcut.weight",
        "encoder.blocks.4.weight",
        "encoder.blocks.4.bias",
        "encoder.blocks.5.weight",
        "quant_conv_mu.weight",
        "quant_conv_log_sigma.bias",
        "post_quant_conv.weight",
        // decoder: conv_in, res(8->8), up, res(8->4), norm, conv_out
        "decoder.blocks.0.weight",
        "decoder.blocks.1.conv2.weight",
        "decoder.blocks.2.conv.bias",
        "decoder.blocks.3.nin_shortcut.weight",
        "decoder.blocks.5.weight",
    ] {
        assert!(data.contains_key(key), "missing {key}");
    }
    assert!(!data.contains_key("encoder.blocks.6.weight"));
    assert_eq!(data["encoder.blocks.0.weight"].dims(), [4, 1, 3, 3, 3]);
    assert_eq!(data["encoder.blocks.5.weight"].dims(), [2, 8, 3, 3, 3]);
    assert_eq!(data["decoder.blocks.5.weight"].dims(), [1, 4, 3, 3, 3]);
    Ok(())
}

#[test]
fn posterior_and_kl() -> Result<()> {
    let config = tiny_config();
    let (_varmap, model) = build(&config)?;
    let x = Tensor::randn(0f32, 1., (1, 1, 4, 4, 4), &Device::Cpu)?;

    let (recon, posterior) = model.forward(&x, false)?;
    assert_eq!(recon.dims(), x.dims());
    let mu = model.encode(&x)?;
    let diff = (posterior.mode() - &mu)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-6);

    let kl = posterior.kl()?.to_scalar::<f32>()?;
    assert!(kl.is_finite() && kl >= 0.0, "kl = {kl}");

    let (sampled, _) = model.forward(&x, true)?;
    assert_eq!(sampled.dims(), x.dims());
    Ok(())
}

#[test]
fn kl_matches_closed_form() -> Result<()> {
    let dev = Device::Cpu;
    // Two identical samples: the batch average equals the per-sample KL.
    let mean = Tensor::new(&[[1f32, 0.], [1., 0.]], &dev)?;
    let log_var = Tensor::new(&[[0f32, 2f32.ln()], [0., 2f32.ln()]], &dev)?;
    let posterior = DiagonalGaussian::new(mean, &log_var)?;
    // 0.5 * ((1 + 1 - 1 - 0) + (0 + 2 - 1 - ln 2))
    let expected = 0.5 * (2. - 2f32.ln());
    let kl = posterior.kl()?.to_scalar::<f32>()?;
    assert!((kl - expected).abs() < 1e-5, "kl = {kl}, expected {expected}");

    let std = posterior.std().to_vec2::<f32>()?;
    assert!((std[0][1] - 2f32.sqrt()).abs() < 1e-5);
    Ok(())
}

#[test]
fn log_var_is_clamped() -> Result<()> {
    let dev = Device::Cpu;
    let mean = Tensor::zeros((1, 3), DType::F32, &dev)?;
    let log_var = Tensor::new(&[[50f32, -40., 1.5]], &dev)?;
    let posterior = DiagonalGaussian::new(mean, &log_var)?;
    assert_eq!(posterior.log_var().to_vec2::<f32>()?, [[20., -30., 1.5]]);
    let std = posterior.std().to_vec2::<f32>()?;
    assert!((std[0][0] - 10f32.exp()).abs() / 10f32.exp() < 1e-5);
    assert!(posterior.kl()?.to_scalar::<f32>()?.is_finite());
    Ok(())
}

#[test]
fn gradients_reach_every_stage() -> Result<()> {
    let config = tiny_config();
    let (varmap, model) = build(&config)?;
    let x = Tensor::randn(0f32, 1., (1, 1, 4, 4, 4), &Device::Cpu)?;
    let z = model.encode(&x)?;
    let recon = model.decode(&z)?;
    let loss = candle_nn::loss::mse(&recon, &x)?;
    let grads = loss.backward()?;

    let data = varmap.data().lock().unwrap();
    for key in ["encoder.blocks.0.weight", "quant_conv_mu.weight", "decoder.blocks.5.weight"] {
        let g = grads.get(data[key].as_tensor());
        assert!(g.is_some(), "no gradient for {key}");
    }
    // The log-sigma head is unused on the deterministic path.
    assert!(grads.get(data["quant_conv_log_sigma.weight"].as_tensor()).is_none());
    Ok(())
}

#[test]
fn halves_share_weights_with_full_model() -> Result<()> {
    let config = tiny_config();
    let (varmap, model) = build(&config)?;
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let encoder = EncoderOnly::new(&config, vb.clone())?;
    let decoder = DecoderOnly::new(&config, vb.clone())?;

    let x = Tensor::randn(0f32, 1., (1, 1, 4, 4, 4), &Device::Cpu)?;
    let z = encoder.encode(&x)?;
    let full = model.encode(&x)?;
    assert!((z.clone() - full)?.abs()?.max_all()?.to_scalar::<f32>()? < 1e-6);
    assert_eq!(decoder.decode(&z)?.dims(), x.dims());

    let bare = Encoder::new(&config, vb.pp("encoder"))?;
    assert_eq!(bare.num_blocks(), 6);
    assert_eq!(bare.forward(&x)?.dims(), [1, 2, 2, 2, 2]);
    Ok(())
}
