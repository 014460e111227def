//! Speed-class classifier: a pure, reporting-only function over measured throughput.
//!
//! Grounded in `original_source/device_speed_test.c`'s threshold tables (SD Association speed
//! classes, UHS speed classes, Video Speed Class, and practical USB transfer-mode floors). Never
//! feeds back into engine decisions -- consumed by the CSV/log summary only.

/// A speed tier a measured sequential write speed qualifies for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpeedClass {
    Class2,
    Class4,
    Class6,
    Class10,
    UhsU1,
    UhsU3,
    VideoV6,
    VideoV10,
    VideoV30,
    VideoV60,
    VideoV90,
    Usb2HiSpeed,
    Usb3SuperSpeed,
}

impl SpeedClass {
    pub fn label(&self) -> &'static str {
        match self {
            SpeedClass::Class2 => "Class 2",
            SpeedClass::Class4 => "Class 4",
            SpeedClass::Class6 => "Class 6",
            SpeedClass::Class10 => "Class 10",
            SpeedClass::UhsU1 => "U1",
            SpeedClass::UhsU3 => "U3",
            SpeedClass::VideoV6 => "V6",
            SpeedClass::VideoV10 => "V10",
            SpeedClass::VideoV30 => "V30",
            SpeedClass::VideoV60 => "V60",
            SpeedClass::VideoV90 => "V90",
            SpeedClass::Usb2HiSpeed => "USB 2.0 Hi-Speed",
            SpeedClass::Usb3SuperSpeed => "USB 3.x SuperSpeed",
        }
    }
}

const MIB: f64 = 1_000_000.0; // class floors are specified in MB/s (decimal megabytes)

const THRESHOLDS: &[(SpeedClass, f64)] = &[
    (SpeedClass::Class2, 2.0 * MIB),
    (SpeedClass::Class4, 4.0 * MIB),
    (SpeedClass::Class6, 6.0 * MIB),
    (SpeedClass::Class10, 10.0 * MIB),
    (SpeedClass::UhsU1, 10.0 * MIB),
    (SpeedClass::UhsU3, 30.0 * MIB),
    (SpeedClass::VideoV6, 6.0 * MIB),
    (SpeedClass::VideoV10, 10.0 * MIB),
    (SpeedClass::VideoV30, 30.0 * MIB),
    (SpeedClass::VideoV60, 60.0 * MIB),
    (SpeedClass::VideoV90, 90.0 * MIB),
    (SpeedClass::Usb2HiSpeed, 25.0 * MIB),
    (SpeedClass::Usb3SuperSpeed, 60.0 * MIB),
];

/// Returns every speed class whose floor `sequential_write_bytes_per_sec` meets or exceeds. A
/// device failing every threshold returns an empty list.
pub fn classify_speed(sequential_write_bytes_per_sec: f64) -> Vec<SpeedClass> {
    THRESHOLDS
        .iter()
        .filter(|(_, floor)| sequential_write_bytes_per_sec >= *floor)
        .map(|(class, _)| *class)
        .collect()
}
