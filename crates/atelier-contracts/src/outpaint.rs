use serde::{Deserialize, Serialize};

/// Largest canvas the service accepts when extending toward `max`.
pub const MAX_CANVAS_WIDTH: u32 = 2048;
pub const MAX_CANVAS_HEIGHT: u32 = 4096;

/// Dimensions assumed when a record never reported its own.
pub const DEFAULT_DIMENSION: u32 = 1024;

/// Per-side extension, each expressed as a fraction of the source dimension on
/// that axis (`left = 0.5` adds half the source width on the left).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Padding {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

impl Padding {
    pub fn uniform(fraction: f64) -> Self {
        Self {
            top: fraction,
            bottom: fraction,
            left: fraction,
            right: fraction,
        }
    }

    fn vertical(total: f64) -> Self {
        let side = (total / 2.0).max(0.0);
        Self {
            top: side,
            bottom: side,
            left: 0.0,
            right: 0.0,
        }
    }

    fn horizontal(total: f64) -> Self {
        let side = (total / 2.0).max(0.0);
        Self {
            top: 0.0,
            bottom: 0.0,
            left: side,
            right: side,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutpaintRatio {
    Square,
    Portrait2x3,
    Landscape4x3,
    Landscape16x9,
    Portrait9x16,
    Max,
}

impl OutpaintRatio {
    pub const ALL: [OutpaintRatio; 6] = [
        OutpaintRatio::Square,
        OutpaintRatio::Portrait2x3,
        OutpaintRatio::Landscape4x3,
        OutpaintRatio::Landscape16x9,
        OutpaintRatio::Portrait9x16,
        OutpaintRatio::Max,
    ];

    pub fn parse(label: &str) -> Option<Self> {
        match normalize_ratio_label(label).as_str() {
            "1:1" => Some(Self::Square),
            "2:3" => Some(Self::Portrait2x3),
            "4:3" => Some(Self::Landscape4x3),
            "16:9" => Some(Self::Landscape16x9),
            "9:16" => Some(Self::Portrait9x16),
            "max" => Some(Self::Max),
            _ => None,
        }
    }

    /// Unknown labels extend toward 4:3.
    pub fn from_label_or_default(label: &str) -> Self {
        Self::parse(label).unwrap_or(Self::Landscape4x3)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Portrait2x3 => "2:3",
            Self::Landscape4x3 => "4:3",
            Self::Landscape16x9 => "16:9",
            Self::Portrait9x16 => "9:16",
            Self::Max => "max",
        }
    }

    pub fn padding(&self, width: u32, height: u32) -> Padding {
        let w = f64::from(width.max(1));
        let h = f64::from(height.max(1));
        match self {
            Self::Square => Padding::uniform(1.0 / 6.0),
            Self::Portrait2x3 => Padding::vertical((w * 1.5 - h) / h),
            Self::Landscape4x3 => Padding::horizontal((h * 4.0 / 3.0 - w) / w),
            Self::Landscape16x9 => Padding::horizontal((h * 16.0 / 9.0 - w) / w),
            Self::Portrait9x16 => Padding::vertical((w * 16.0 / 9.0 - h) / h),
            Self::Max => {
                let vertical = Padding::vertical((f64::from(MAX_CANVAS_HEIGHT) - h) / h);
                let horizontal = Padding::horizontal((f64::from(MAX_CANVAS_WIDTH) - w) / w);
                Padding {
                    top: vertical.top,
                    bottom: vertical.bottom,
                    left: horizontal.left,
                    right: horizontal.right,
                }
            }
        }
    }
}

/// Accepts the full-width colon chat clients tend to produce.
pub fn normalize_ratio_label(raw: &str) -> String {
    raw.trim().replace('：', ":").to_ascii_lowercase()
}
