//! Model snapshots stored as safetensors files.
//!
//! Every parameter and buffer is stored as an F32 tensor named after its qualified name in the
//! model (e.g. `pretrained_net.features.0.weight`, `bn1.running_mean`). The quantization settings
//! of every quantization-aware layer go into the header's metadata as `<layer>.n_lv`,
//! `<layer>.bound` and `<layer>.ratio`.

use std::{collections::HashMap, fs, path::Path, str::FromStr};

use log::debug;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{MlErr, Result, arch::Model, quantization::QuantSlot};

/// The prefix that data-parallel wrappers add to every key.
const WRAPPER_PREFIX: &str = "module.";

/// Batch norm step counters that some frameworks persist and this model doesn't track.
const IGNORED_SUFFIX: &str = ".num_batches_tracked";

/// Serializes every parameter, buffer and quantization setting of `model`.
pub fn to_bytes<M: Model + ?Sized>(model: &mut M) -> Result<Vec<u8>> {
    let metadata = quant_metadata(model);

    let state = model.state_mut();
    let mut tensors = Vec::with_capacity(state.len());
    for (name, tensor) in &state {
        let bytes: &[u8] = bytemuck::cast_slice(&*tensor.value);
        tensors.push((name.clone(), TensorView::new(Dtype::F32, tensor.shape.to_vec(), bytes)?));
    }

    Ok(safetensors::serialize(tensors, &Some(metadata))?)
}

/// Writes a snapshot of `model` to `path`, overwriting any previous file.
pub fn save<M, P>(model: &mut M, path: P) -> Result<()>
where
    M: Model + ?Sized,
    P: AsRef<Path>,
{
    let path = path.as_ref();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, to_bytes(model)?)?;
    debug!("saved model snapshot to {}", path.display());
    Ok(())
}

/// Loads a snapshot into `model`.
///
/// A leading `module.` is stripped from every key. Loading is strict: every tensor of the model
/// must be present with the same shape and the snapshot can't have tensors the model doesn't.
///
/// # Returns
/// The amount of tensors loaded.
pub fn load_bytes<M: Model + ?Sized>(model: &mut M, bytes: &[u8]) -> Result<usize> {
    let snapshot = SafeTensors::deserialize(bytes)?;

    let mut state: HashMap<_, _> = model.state_mut().into_iter().collect();
    let mut loaded = 0;

    for (key, view) in snapshot.tensors() {
        let name = key.strip_prefix(WRAPPER_PREFIX).unwrap_or(&key);

        if name.ends_with(IGNORED_SUFFIX) {
            debug!("skipping {key}");
            continue;
        }

        let tensor = state
            .remove(name)
            .ok_or_else(|| MlErr::CheckpointUnexpectedKey(key.clone()))?;

        if view.dtype() != Dtype::F32 {
            return Err(MlErr::CheckpointDtype {
                key,
                dtype: format!("{:?}", view.dtype()),
            });
        }

        if view.shape() != tensor.shape {
            return Err(MlErr::CheckpointShapeMismatch {
                key,
                got: view.shape().to_vec(),
                expected: tensor.shape.to_vec(),
            });
        }

        tensor
            .value
            .iter_mut()
            .zip(view.data().chunks_exact(4))
            .for_each(|(v, bytes)| *v = bytemuck::pod_read_unaligned(bytes));

        debug!("{key} -> {name}");
        loaded += 1;
    }

    if let Some(missing) = state.into_keys().min() {
        return Err(MlErr::CheckpointMissingKey(missing));
    }

    let (_, header) = SafeTensors::read_metadata(bytes)?;
    if let Some(metadata) = header.metadata() {
        restore_quant_metadata(model, metadata)?;
    }

    Ok(loaded)
}

/// Reads the snapshot at `path` into `model`, see [`load_bytes`].
pub fn load<M, P>(model: &mut M, path: P) -> Result<usize>
where
    M: Model + ?Sized,
    P: AsRef<Path>,
{
    let bytes = fs::read(path)?;
    load_bytes(model, &bytes)
}

fn quant_metadata<M: Model + ?Sized>(model: &mut M) -> HashMap<String, String> {
    let mut metadata = HashMap::new();

    for (name, layer) in model.layers_mut() {
        match layer.quant_slot() {
            Some(QuantSlot::Activation(q)) => {
                metadata.insert(format!("{name}.n_lv"), q.n_lv.to_string());
                metadata.insert(format!("{name}.bound"), q.bound.to_string());
            }
            Some(QuantSlot::Weight(q)) => {
                metadata.insert(format!("{name}.n_lv"), q.n_lv.to_string());
                metadata.insert(format!("{name}.ratio"), q.ratio.to_string());
            }
            None => {}
        }
    }

    metadata
}

fn parse<T: FromStr>(metadata: &HashMap<String, String>, key: &str) -> Result<Option<T>> {
    let Some(value) = metadata
        .get(key)
        .or_else(|| metadata.get(&format!("{WRAPPER_PREFIX}{key}")))
    else {
        return Ok(None);
    };

    value.parse().map(Some).map_err(|_| MlErr::CheckpointMetadata {
        key: key.to_string(),
        value: value.clone(),
    })
}

fn restore_quant_metadata<M: Model + ?Sized>(
    model: &mut M,
    metadata: &HashMap<String, String>,
) -> Result<()> {
    for (name, layer) in model.layers_mut() {
        match layer.quant_slot() {
            Some(QuantSlot::Activation(q)) => {
                if let Some(n_lv) = parse(metadata, &format!("{name}.n_lv"))? {
                    q.n_lv = n_lv;
                }
                if let Some(bound) = parse(metadata, &format!("{name}.bound"))? {
                    q.bound = bound;
                }
            }
            Some(QuantSlot::Weight(q)) => {
                if let Some(n_lv) = parse(metadata, &format!("{name}.n_lv"))? {
                    q.n_lv = n_lv;
                }
                if let Some(ratio) = parse(metadata, &format!("{name}.ratio"))? {
                    q.ratio = ratio;
                }
            }
            None => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{
        arch::{Fcn, FcnConfig, VggConfig},
        quantization::QuantSettings,
    };

    fn tiny_fcn(seed: u64) -> Fcn {
        let config = FcnConfig {
            n_class: 3,
            backbone: VggConfig::uniform(2, 1),
        };
        Fcn::new(&config, &mut StdRng::seed_from_u64(seed))
    }

    fn values(model: &mut Fcn) -> Vec<(String, Vec<f32>)> {
        let mut state: Vec<_> = model
            .state_mut()
            .into_iter()
            .map(|(name, t)| (name, t.value.to_vec()))
            .collect();
        state.sort_by(|a, b| a.0.cmp(&b.0));
        state
    }

    #[test]
    fn snapshots_restore_every_tensor_and_quantizer() {
        let mut source = tiny_fcn(1);
        QuantSettings {
            n_lv: 4,
            bound: 2.,
            ratio: 0.25,
        }
        .apply(&mut source);
        let bytes = to_bytes(&mut source).unwrap();

        let mut target = tiny_fcn(2);
        assert_ne!(values(&mut source), values(&mut target));

        let loaded = load_bytes(&mut target, &bytes).unwrap();
        assert_eq!(loaded, values(&mut source).len());
        assert_eq!(values(&mut source), values(&mut target));

        for (name, layer) in target.layers_mut() {
            match layer.quant_slot() {
                Some(QuantSlot::Activation(q)) => assert_eq!((q.n_lv, q.bound), (4, 2.), "{name}"),
                Some(QuantSlot::Weight(q)) => assert_eq!((q.n_lv, q.ratio), (4, 0.25), "{name}"),
                None => {}
            }
        }
    }

    fn rewrite(bytes: &[u8], f: impl Fn(&str) -> Option<String>) -> Vec<u8> {
        let snapshot = SafeTensors::deserialize(bytes).unwrap();
        let tensors: Vec<_> = snapshot
            .tensors()
            .into_iter()
            .filter_map(|(key, view)| f(&key).map(|key| (key, view)))
            .collect();

        safetensors::serialize(tensors, &None::<HashMap<String, String>>).unwrap()
    }

    #[test]
    fn wrapper_prefix_is_stripped() {
        let mut source = tiny_fcn(1);
        let bytes = to_bytes(&mut source).unwrap();
        let wrapped = rewrite(&bytes, |key| Some(format!("module.{key}")));

        let mut target = tiny_fcn(2);
        load_bytes(&mut target, &wrapped).unwrap();
        assert_eq!(values(&mut source), values(&mut target));
    }

    #[test]
    fn missing_tensors_are_rejected() {
        let bytes = to_bytes(&mut tiny_fcn(1)).unwrap();
        let partial = rewrite(&bytes, |key| (key != "bn1.running_var").then(|| key.to_string()));

        let err = load_bytes(&mut tiny_fcn(2), &partial).unwrap_err();
        assert!(matches!(err, MlErr::CheckpointMissingKey(key) if key == "bn1.running_var"));
    }

    #[test]
    fn unexpected_tensors_are_rejected() {
        let bytes = to_bytes(&mut tiny_fcn(1)).unwrap();
        let renamed = rewrite(&bytes, |key| {
            Some(key.replace("classifier.bias", "score.bias"))
        });

        let err = load_bytes(&mut tiny_fcn(2), &renamed).unwrap_err();
        assert!(matches!(err, MlErr::CheckpointUnexpectedKey(key) if key == "score.bias"));
    }

    #[test]
    fn shape_mismatches_are_rejected() {
        let bytes = to_bytes(&mut tiny_fcn(1)).unwrap();

        let mut wider = Fcn::new(
            &FcnConfig {
                n_class: 5,
                backbone: VggConfig::uniform(2, 1),
            },
            &mut StdRng::seed_from_u64(0),
        );

        assert!(matches!(
            load_bytes(&mut wider, &bytes),
            Err(MlErr::CheckpointShapeMismatch { .. })
        ));
    }

    #[test]
    fn save_and_load_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("snapshot");

        let mut source = tiny_fcn(1);
        save(&mut source, &path).unwrap();
        save(&mut source, &path).unwrap();

        let mut target = tiny_fcn(2);
        load(&mut target, &path).unwrap();
        assert_eq!(values(&mut source), values(&mut target));
    }
}
