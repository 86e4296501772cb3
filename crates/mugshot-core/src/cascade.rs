//! Haar cascade model loaded from OpenCV cascade XML.
//!
//! Both the current `opencv-cascade-classifier` layout (shared feature table,
//! `internalNodes`/`leafValues` per weak classifier) and the legacy
//! `opencv-haar-classifier` layout (features inlined in tree nodes) are
//! accepted and converted into the same immutable model.

use crate::detector::DetectorError;
use roxmltree::{Document, Node};
use std::path::Path;

/// Slack applied when comparing a stage sum to its threshold.
pub(crate) const STAGE_THRESHOLD_EPS: f64 = 1e-4;

/// A weighted rectangle in base-window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaarRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

/// A Haar-like feature: two or three weighted rectangles.
#[derive(Debug, Clone, PartialEq)]
pub struct HaarFeature {
    pub rects: Vec<HaarRect>,
}

/// Where a tree node branches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    Node(usize),
    Leaf(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    /// Index into [`HaarCascade::features`].
    pub feature: usize,
    pub threshold: f32,
    pub left: Child,
    pub right: Child,
}

/// Boosted weak classifier: a small decision tree over features.
#[derive(Debug, Clone, PartialEq)]
pub struct WeakClassifier {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

impl WeakClassifier {
    /// Walk the tree from the root. `goes_left` decides each split.
    ///
    /// Child node indices always point forward (checked at load), so the
    /// walk terminates.
    pub(crate) fn evaluate(&self, mut goes_left: impl FnMut(&TreeNode) -> bool) -> f64 {
        let mut idx = 0;
        loop {
            let node = &self.nodes[idx];
            let child = if goes_left(node) { node.left } else { node.right };
            match child {
                Child::Node(next) => idx = next,
                Child::Leaf(leaf) => return self.leaves[leaf] as f64,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// Immutable Haar cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct HaarCascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
    pub features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Load a cascade XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DetectorError::ModelNotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml_str(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?(cascade.window_width, cascade.window_height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse a cascade from XML text.
    pub fn from_xml_str(xml: &str) -> Result<Self, DetectorError> {
        let doc = Document::parse(xml)?;
        let storage = doc.root_element();
        let root = elements(storage)
            .next()
            .ok_or_else(|| invalid("empty opencv_storage"))?;

        let cascade = if find(root, "size").is_some() {
            parse_legacy(root)?
        } else if find(root, "width").is_some() && find(root, "height").is_some() {
            parse_current(root)?
        } else {
            return Err(invalid(&format!(
                "<{}> is neither a current nor a legacy Haar cascade",
                root.tag_name().name()
            )));
        };

        cascade.validate()?;
        Ok(cascade)
    }

    /// Outcome of the cascade on a pixel-constant window.
    ///
    /// Every feature rectangle of such a window sums to the same mean, so each
    /// feature evaluates to zero and each split compares `0 < threshold` with
    /// the normalization at one.
    pub fn flat_verdict(&self) -> bool {
        self.stages.iter().all(|stage| {
            let sum: f64 = stage
                .classifiers
                .iter()
                .map(|wc| wc.evaluate(|node| 0.0 < node.threshold))
                .sum();
            sum >= stage.threshold as f64 - STAGE_THRESHOLD_EPS
        })
    }

    fn validate(&self) -> Result<(), DetectorError> {
        if self.window_width < 3 || self.window_height < 3 {
            return Err(invalid(&format!(
                "window {}x{} is too small",
                self.window_width, self.window_height
            )));
        }
        if self.stages.is_empty() {
            return Err(invalid("cascade has no stages"));
        }
        for (i, feature) in self.features.iter().enumerate() {
            if feature.rects.len() < 2 || feature.rects.len() > 3 {
                return Err(invalid(&format!("feature {i} has {} rects", feature.rects.len())));
            }
            for r in &feature.rects {
                if r.x + r.width > self.window_width || r.y + r.height > self.window_height {
                    return Err(invalid(&format!("feature {i} rect {r:?} exceeds the window")));
                }
            }
        }
        for (s, stage) in self.stages.iter().enumerate() {
            for wc in &stage.classifiers {
                if wc.nodes.is_empty() {
                    return Err(invalid(&format!("stage {s} has an empty tree")));
                }
                for (n, node) in wc.nodes.iter().enumerate() {
                    if node.feature >= self.features.len() {
                        return Err(invalid(&format!(
                            "stage {s} references missing feature {}",
                            node.feature
                        )));
                    }
                    for child in [node.left, node.right] {
                        match child {
                            Child::Node(c) if c <= n || c >= wc.nodes.len() => {
                                return Err(invalid(&format!("stage {s} has a bad node link {c}")));
                            }
                            Child::Leaf(l) if l >= wc.leaves.len() => {
                                return Err(invalid(&format!("stage {s} has a bad leaf link {l}")));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl From<roxmltree::Error> for DetectorError {
    fn from(e: roxmltree::Error) -> Self {
        DetectorError::InvalidModel(format!("xml: {e}"))
    }
}

fn invalid(msg: &str) -> DetectorError {
    DetectorError::InvalidModel(msg.to_string())
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn find<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    elements(node).find(|n| n.tag_name().name() == name)
}

fn require<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Result<Node<'a, 'input>, DetectorError> {
    find(node, name).ok_or_else(|| {
        invalid(&format!("<{}> is missing <{name}>", node.tag_name().name()))
    })
}

/// Concatenated text content of an element, ignoring comments.
fn text(node: Node) -> String {
    node.children()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

fn numbers<T: std::str::FromStr>(node: Node) -> Result<Vec<T>, DetectorError> {
    text(node)
        .split_whitespace()
        .map(|tok| {
            tok.parse::<T>()
                .map_err(|_| invalid(&format!("bad number {tok:?} in <{}>", node.tag_name().name())))
        })
        .collect()
}

fn number<T: std::str::FromStr>(node: Node, name: &str) -> Result<T, DetectorError> {
    let el = require(node, name)?;
    numbers::<T>(el)?
        .into_iter()
        .next()
        .ok_or_else(|| invalid(&format!("<{name}> is empty")))
}

fn parse_rects(feature: Node) -> Result<HaarFeature, DetectorError> {
    if let Some(tilted) = find(feature, "tilted") {
        if numbers::<i32>(tilted)?.first().copied().unwrap_or(0) != 0 {
            return Err(DetectorError::UnsupportedFeature("tilted Haar feature".into()));
        }
    }
    let rects = elements(require(feature, "rects")?)
        .map(|r| {
            let v = numbers::<f32>(r)?;
            if v.len() != 5 || v[..4].iter().any(|&c| c < 0.0) {
                return Err(invalid(&format!("rect needs 5 values, got {v:?}")));
            }
            Ok(HaarRect {
                x: v[0] as u32,
                y: v[1] as u32,
                width: v[2] as u32,
                height: v[3] as u32,
                weight: v[4],
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(HaarFeature { rects })
}

/// `<cascade type_id="opencv-cascade-classifier">` (OpenCV ≥ 2.4).
fn parse_current(root: Node) -> Result<HaarCascade, DetectorError> {
    if let Some(ft) = find(root, "featureType") {
        let kind = text(ft);
        if kind.trim() != "HAAR" {
            return Err(DetectorError::UnsupportedFeature(format!("feature type {}", kind.trim())));
        }
    }
    let window_width = number::<u32>(root, "width")?;
    let window_height = number::<u32>(root, "height")?;

    let features = elements(require(root, "features")?)
        .map(parse_rects)
        .collect::<Result<Vec<_>, _>>()?;

    let mut stages = Vec::new();
    for stage in elements(require(root, "stages")?) {
        let threshold = number::<f32>(stage, "stageThreshold")?;
        let mut classifiers = Vec::new();
        for weak in elements(require(stage, "weakClassifiers")?) {
            let raw = numbers::<f64>(require(weak, "internalNodes")?)?;
            let leaves = numbers::<f32>(require(weak, "leafValues")?)?;
            if raw.is_empty() || raw.len() % 4 != 0 {
                return Err(invalid("internalNodes must hold groups of 4 values"));
            }
            // Children > 0 are internal nodes, <= 0 are negated leaf indices.
            let child = |v: f64| -> Child {
                let v = v as i64;
                if v > 0 {
                    Child::Node(v as usize)
                } else {
                    Child::Leaf((-v) as usize)
                }
            };
            let nodes = raw
                .chunks_exact(4)
                .map(|n| TreeNode {
                    left: child(n[0]),
                    right: child(n[1]),
                    feature: n[2] as usize,
                    threshold: n[3] as f32,
                })
                .collect();
            classifiers.push(WeakClassifier { nodes, leaves });
        }
        stages.push(Stage { threshold, classifiers });
    }

    Ok(HaarCascade {
        window_width,
        window_height,
        stages,
        features,
    })
}

/// `<name type_id="opencv-haar-classifier">` (OpenCV 1.x).
fn parse_legacy(root: Node) -> Result<HaarCascade, DetectorError> {
    let size = numbers::<u32>(require(root, "size")?)?;
    let &[window_width, window_height] = size.as_slice() else {
        return Err(invalid("<size> needs two values"));
    };

    let mut features = Vec::new();
    let mut stages = Vec::new();
    for stage in elements(require(root, "stages")?) {
        let threshold = number::<f32>(stage, "stage_threshold")?;
        let mut classifiers = Vec::new();
        for tree in elements(require(stage, "trees")?) {
            let mut nodes = Vec::new();
            let mut leaves = Vec::new();
            for node in elements(tree) {
                features.push(parse_rects(require(node, "feature")?)?);
                let mut branch = |val: &str, link: &str| -> Result<Child, DetectorError> {
                    if find(node, val).is_some() {
                        leaves.push(number::<f32>(node, val)?);
                        Ok(Child::Leaf(leaves.len() - 1))
                    } else {
                        Ok(Child::Node(number::<usize>(node, link)?))
                    }
                };
                let left = branch("left_val", "left_node")?;
                let right = branch("right_val", "right_node")?;
                nodes.push(TreeNode {
                    feature: features.len() - 1,
                    threshold: number::<f32>(node, "threshold")?,
                    left,
                    right,
                });
            }
            classifiers.push(WeakClassifier { nodes, leaves });
        }
        stages.push(Stage { threshold, classifiers });
    }

    Ok(HaarCascade {
        window_width,
        window_height,
        stages,
        features,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One-stage cascade that fires on a dark square centred in the window
    /// against a light surround.
    pub(crate) const DARK_CENTER_CASCADE: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>20</height>
  <width>20</width>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 -1.</internalNodes>
          <leafValues>
            1. -1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 20 20 -1.</_>
        <_>
          5 5 10 10 4.</_></rects></_></features>
</cascade>
</opencv_storage>
"#;

    const DARK_CENTER_LEGACY: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<dark_center type_id="opencv-haar-classifier">
  <size>20 20</size>
  <stages>
    <_>
      <!-- stage 0 -->
      <trees>
        <_>
          <!-- tree 0 -->
          <_>
            <!-- root node -->
            <feature>
              <rects>
                <_>0 0 20 20 -1.</_>
                <_>5 5 10 10 4.</_></rects>
              <tilted>0</tilted></feature>
            <threshold>-1.</threshold>
            <left_val>1.</left_val>
            <right_val>-1.</right_val></_></_></trees>
      <stage_threshold>0.</stage_threshold>
      <parent>-1</parent>
      <next>-1</next></_></stages></dark_center>
</opencv_storage>
"#;

    #[test]
    fn test_parse_current_layout() {
        let c = HaarCascade::from_xml_str(DARK_CENTER_CASCADE).unwrap();
        assert_eq!((c.window_width, c.window_height), (20, 20));
        assert_eq!(c.stages.len(), 1);
        assert_eq!(c.features.len(), 1);
        assert_eq!(c.features[0].rects[1], HaarRect { x: 5, y: 5, width: 10, height: 10, weight: 4.0 });
        let wc = &c.stages[0].classifiers[0];
        assert_eq!(wc.nodes[0].left, Child::Leaf(0));
        assert_eq!(wc.nodes[0].right, Child::Leaf(1));
        assert_eq!(wc.leaves, vec![1.0, -1.0]);
    }

    #[test]
    fn test_legacy_layout_matches_current() {
        let current = HaarCascade::from_xml_str(DARK_CENTER_CASCADE).unwrap();
        let legacy = HaarCascade::from_xml_str(DARK_CENTER_LEGACY).unwrap();
        assert_eq!(current, legacy);
    }

    #[test]
    fn test_multi_node_tree_walk() {
        let wc = WeakClassifier {
            nodes: vec![
                TreeNode { feature: 0, threshold: 0.0, left: Child::Node(1), right: Child::Leaf(0) },
                TreeNode { feature: 0, threshold: 0.0, left: Child::Leaf(1), right: Child::Leaf(2) },
            ],
            leaves: vec![0.5, 1.5, 2.5],
        };
        assert_eq!(wc.evaluate(|_| false), 0.5);
        assert_eq!(wc.evaluate(|_| true), 1.5);
        let mut calls = 0;
        assert_eq!(wc.evaluate(|_| { calls += 1; calls == 1 }), 2.5);
    }

    #[test]
    fn test_flat_verdict_rejects() {
        let c = HaarCascade::from_xml_str(DARK_CENTER_CASCADE).unwrap();
        // 0 < -1 is false, so the flat window takes the -1 leaf and fails the stage.
        assert!(!c.flat_verdict());
    }

    #[test]
    fn test_flat_verdict_accepts_when_threshold_positive() {
        let xml = DARK_CENTER_CASCADE.replace("0 -1 0 -1.", "0 -1 0 1.");
        let c = HaarCascade::from_xml_str(&xml).unwrap();
        assert!(c.flat_verdict());
    }

    #[test]
    fn test_tilted_feature_rejected() {
        let xml = DARK_CENTER_LEGACY.replace("<tilted>0</tilted>", "<tilted>1</tilted>");
        let err = HaarCascade::from_xml_str(&xml).unwrap_err();
        assert!(matches!(err, DetectorError::UnsupportedFeature(_)));
    }

    #[test]
    fn test_lbp_cascade_rejected() {
        let xml = DARK_CENTER_CASCADE.replace("<featureType>HAAR", "<featureType>LBP");
        let err = HaarCascade::from_xml_str(&xml).unwrap_err();
        assert!(matches!(err, DetectorError::UnsupportedFeature(_)));
    }

    #[test]
    fn test_rect_outside_window_rejected() {
        let xml = DARK_CENTER_CASCADE.replace("5 5 10 10 4.", "15 5 10 10 4.");
        let err = HaarCascade::from_xml_str(&xml).unwrap_err();
        assert!(matches!(err, DetectorError::InvalidModel(_)));
    }

    #[test]
    fn test_malformed_xml() {
        let err = HaarCascade::from_xml_str("<opencv_storage><cascade>").unwrap_err();
        assert!(matches!(err, DetectorError::InvalidModel(_)));
    }

    #[test]
    fn test_bad_number() {
        let xml = DARK_CENTER_CASCADE.replace("<stageThreshold>0.", "<stageThreshold>zero");
        let err = HaarCascade::from_xml_str(&xml).unwrap_err();
        assert!(matches!(err, DetectorError::InvalidModel(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = HaarCascade::load("/nonexistent/haarcascade.xml").unwrap_err();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }
}
