//! Interface to the host tool that turns finished images into a shading
//! graph.
//!
//! The host implements [`ResultMaterializer`]. The core hands it the
//! decoded images plus the slider values bound into the job, unmodified.

use crate::history::HistoryEntry;
use crate::job::ImageAsset;
use crate::naming::friendly_name;
use crate::params::{ColorRamp, MaterialControls, OutputKind, TextureMap};

// ---------------------------------------------------------------------------
// Control group layout
// ---------------------------------------------------------------------------

pub const METALLIC: &str = "Metallic";
pub const ROUGHNESS: &str = "Roughness";
pub const NORMAL_STRENGTH: &str = "Normal Strength";
pub const EMISSION: &str = "Emission";
pub const ALPHA: &str = "Alpha";
pub const SPECULAR: &str = "Specular";
pub const IOR: &str = "IOR";
pub const TRANSMISSION: &str = "Transmission";
pub const BUMP_RAMP: &str = "Bump Ramp";
pub const DISPLACEMENT_RAMP: &str = "Displacement Ramp";

/// Scalar sockets of the control group, in display order.
pub const CONTROL_SOCKETS: [&str; 8] = [
    METALLIC,
    ROUGHNESS,
    NORMAL_STRENGTH,
    EMISSION,
    ALPHA,
    SPECULAR,
    IOR,
    TRANSMISSION,
];

/// Value of one control in the group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlValue {
    Scalar(f64),
    Ramp(ColorRamp),
}

/// Every control of the group with its value: the eight scalar sockets
/// followed by the bump and displacement ramps.
pub fn control_values(controls: &MaterialControls) -> Vec<(&'static str, ControlValue)> {
    vec![
        (METALLIC, ControlValue::Scalar(controls.metallic)),
        (ROUGHNESS, ControlValue::Scalar(controls.roughness)),
        (NORMAL_STRENGTH, ControlValue::Scalar(controls.normal_strength)),
        (EMISSION, ControlValue::Scalar(controls.emission)),
        (ALPHA, ControlValue::Scalar(controls.alpha)),
        (SPECULAR, ControlValue::Scalar(controls.specular)),
        (IOR, ControlValue::Scalar(controls.ior)),
        (TRANSMISSION, ControlValue::Scalar(controls.transmission)),
        (BUMP_RAMP, ControlValue::Ramp(controls.bump_ramp)),
        (DISPLACEMENT_RAMP, ControlValue::Ramp(controls.displacement_ramp)),
    ]
}

// ---------------------------------------------------------------------------
// Request and trait
// ---------------------------------------------------------------------------

/// Input for one materialization.
#[derive(Debug, Clone, Copy)]
pub struct MaterializeRequest<'a> {
    /// Display name for the material or image set.
    pub name: &'a str,
    pub assets: &'a [ImageAsset],
    pub controls: &'a MaterialControls,
    pub output: &'a OutputKind,
}

impl<'a> MaterializeRequest<'a> {
    /// Control values to expose, or `None` for texture-only output.
    pub fn control_group(&self) -> Option<Vec<(&'static str, ControlValue)>> {
        self.output
            .is_material()
            .then(|| control_values(self.controls))
    }

    /// Assets paired with the map each one fills (texture-only output).
    pub fn maps(&self) -> impl Iterator<Item = (Option<TextureMap>, &'a ImageAsset)> + 'a {
        self.assets.iter().map(|asset| (asset.map, asset))
    }
}

/// Display name for a recorded generation.
pub fn material_name(prefix: &str, entry: &HistoryEntry) -> String {
    friendly_name(prefix, entry.id, &entry.request.bound.params.prompt)
}

/// Implemented by the host tool to build a shading graph.
pub trait ResultMaterializer {
    type Output;
    type Error: std::error::Error + Send + Sync + 'static;

    fn materialize(&mut self, request: MaterializeRequest<'_>) -> Result<Self::Output, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ArtifactRef;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<(String, usize, Option<Vec<(&'static str, ControlValue)>>)>,
    }

    impl ResultMaterializer for Recorder {
        type Output = usize;
        type Error = std::io::Error;

        fn materialize(&mut self, request: MaterializeRequest<'_>) -> Result<usize, Self::Error> {
            self.seen.push((
                request.name.to_string(),
                request.assets.len(),
                request.control_group(),
            ));
            Ok(self.seen.len())
        }
    }

    fn asset(map: Option<TextureMap>) -> ImageAsset {
        ImageAsset {
            artifact: ArtifactRef {
                filename: "x.png".to_string(),
                subfolder: String::new(),
                kind: "output".to_string(),
                node_id: "9".to_string(),
            },
            map,
            width: 8,
            height: 8,
            bytes: vec![1, 2, 3],
        }
    }

    #[test]
    fn material_gets_controls_unchanged() {
        let controls = MaterialControls {
            roughness: 0.33,
            ior: 1.45,
            ..Default::default()
        };
        let assets = [asset(None)];
        let mut recorder = Recorder::default();
        recorder
            .materialize(MaterializeRequest {
                name: "Diffusion_001_brick_wall",
                assets: &assets,
                controls: &controls,
                output: &OutputKind::Material,
            })
            .unwrap();

        let group = recorder.seen[0].2.as_ref().unwrap();
        assert_eq!(group.len(), CONTROL_SOCKETS.len() + 2);
        assert_eq!(group[1], (ROUGHNESS, ControlValue::Scalar(0.33)));
        assert_eq!(group[6], (IOR, ControlValue::Scalar(1.45)));
        assert_eq!(
            group[8],
            (BUMP_RAMP, ControlValue::Ramp(ColorRamp::default()))
        );
    }

    #[test]
    fn texture_only_has_no_controls() {
        let controls = MaterialControls::default();
        let output = OutputKind::TextureOnly {
            maps: vec![TextureMap::BaseColor, TextureMap::Normal],
        };
        let assets = [asset(Some(TextureMap::BaseColor)), asset(Some(TextureMap::Normal))];
        let request = MaterializeRequest {
            name: "n",
            assets: &assets,
            controls: &controls,
            output: &output,
        };
        assert!(request.control_group().is_none());
        let maps: Vec<_> = request.maps().map(|(m, _)| m).collect();
        assert_eq!(maps, vec![Some(TextureMap::BaseColor), Some(TextureMap::Normal)]);
    }

    #[test]
    fn socket_order_matches_values() {
        let values = control_values(&MaterialControls::default());
        for (socket, (name, _)) in CONTROL_SOCKETS.iter().zip(&values) {
            assert_eq!(socket, name);
        }
    }
}
