use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::{Price, Product, Provenance, Source};

/// Which origin wins each contested field when records share a UPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePolicy {
    /// Wins name, brand and sourceUrl.
    pub primary: String,
    /// Wins sourceImageUrl.
    pub image: String,
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy {
            primary: "montania".to_string(),
            image: "rol".to_string(),
        }
    }
}

/// Products sharing one UPC, in encounter order.
#[derive(Debug)]
pub struct MergeGroup<'a> {
    pub upc: &'a str,
    pub members: Vec<&'a Product>,
}

type Field = fn(&Product) -> Option<&String>;

impl<'p> MergeGroup<'p> {
    /// First non-null value from the origins in `order`, else the first non-null at all.
    fn pick(&self, get: Field, order: &[&str]) -> Option<(&'p Product, &'p String)> {
        let first_from = |p: &&'p Product| get(*p).map(|v| (*p, v));
        order
            .iter()
            .find_map(|tag| {
                self.members
                    .iter()
                    .filter(|p| p.source.as_str() == *tag)
                    .find_map(first_from)
            })
            .or_else(|| self.members.iter().find_map(first_from))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStats {
    pub input: usize,
    pub output: usize,
    pub no_identity: usize,
    pub singletons: usize,
    pub groups_merged: usize,
    pub records_removed: usize,
}

impl MergeStats {
    pub fn print(&self) {
        println!("Input records:     {}", self.input);
        println!("Without UPC:       {}", self.no_identity);
        println!("Unique UPCs:       {}", self.singletons);
        println!("Groups merged:     {}", self.groups_merged);
        println!("Records removed:   {}", self.records_removed);
        println!("Output records:    {}", self.output);
    }
}

/// Default run token: UTC timestamp, second resolution.
pub fn run_token() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Split products into those without a UPC and UPC groups in first-encounter order.
pub fn group_by_upc(products: &[Product]) -> (Vec<&Product>, Vec<MergeGroup<'_>>) {
    let mut no_identity = Vec::new();
    let mut groups: Vec<MergeGroup> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for p in products {
        let Some(upc) = p.upc.as_deref() else {
            no_identity.push(p);
            continue;
        };
        match index.get(upc) {
            Some(&i) => groups[i].members.push(p),
            None => {
                index.insert(upc, groups.len());
                groups.push(MergeGroup { upc, members: vec![p] });
            }
        }
    }
    (no_identity, groups)
}

/// Collapse every UPC group into one record. Output order is: records without a UPC,
/// then unique UPCs, then merged groups, each in first-encounter order.
pub fn merge(
    products: &[Product],
    policy: &MergePolicy,
    run_token: &str,
) -> (Vec<Product>, MergeStats) {
    let (no_identity, groups) = group_by_upc(products);
    let (singles, multi): (Vec<_>, Vec<_>) =
        groups.into_iter().partition(|g| g.members.len() == 1);

    let merged: Vec<Product> = multi
        .par_iter()
        .map(|g| merge_group(g, policy, run_token))
        .collect();

    let stats = MergeStats {
        input: products.len(),
        output: no_identity.len() + singles.len() + merged.len(),
        no_identity: no_identity.len(),
        singletons: singles.len(),
        groups_merged: merged.len(),
        records_removed: multi.iter().map(|g| g.members.len() - 1).sum(),
    };
    info!(
        input = stats.input,
        output = stats.output,
        merged = stats.groups_merged,
        "Merged catalog"
    );

    let out = no_identity
        .into_iter()
        .cloned()
        .chain(singles.into_iter().map(|g| g.members[0].clone()))
        .chain(merged)
        .collect();
    (out, stats)
}

/// Reconcile one multi-member group. Total: always yields a record.
pub fn merge_group(group: &MergeGroup, policy: &MergePolicy, run_token: &str) -> Product {
    let mut criteria = BTreeMap::new();
    let mut unresolved = Vec::new();

    let mut take = |field: &str, picked: Option<(&Product, &String)>| -> Option<String> {
        let (p, v) = picked?;
        criteria.insert(field.to_string(), p.source.to_string());
        Some(v.clone())
    };

    let primary = [policy.primary.as_str()];
    let image_order = [policy.image.as_str(), policy.primary.as_str()];

    let name = take("name", group.pick(|p| p.name.as_ref(), &primary));
    let brand = take("brand", group.pick(|p| p.brand.as_ref(), &primary));
    let source_url = take("sourceUrl", group.pick(|p| p.source_url.as_ref(), &primary));
    let source_image_url = take(
        "sourceImageUrl",
        group.pick(|p| p.source_image_url.as_ref(), &image_order),
    );

    let cheapest = group
        .members
        .iter()
        .filter(|p| !p.price.is_zero())
        .min_by_key(|p| p.price);
    let price = match cheapest {
        Some(p) => {
            criteria.insert("price".to_string(), p.source.to_string());
            p.price
        }
        None => {
            warn!(upc = group.upc, members = group.members.len(), "No member has a usable price");
            unresolved.push("price".to_string());
            Price::ZERO
        }
    };

    if name.is_none() {
        warn!(upc = group.upc, "No member has a name");
        unresolved.push("name".to_string());
    }

    let source_urls: Vec<String> = source_url
        .iter()
        .chain(group.members.iter().flat_map(|p| p.source_url.iter().chain(&p.source_urls)))
        .unique()
        .cloned()
        .collect();

    let original_sources: Vec<String> = group
        .members
        .iter()
        .map(|p| p.source.to_string())
        .unique()
        .collect();

    let error = if group.members.iter().all(|p| p.error.is_some()) {
        group.members[0].error.clone()
    } else {
        None
    };

    debug!(upc = group.upc, members = group.members.len(), "Merged group");

    Product {
        id: format!("merged_{}_{}", group.upc, run_token),
        name,
        brand,
        upc: Some(group.upc.to_string()),
        price,
        source_image_url,
        source_url,
        source_urls,
        source: Source::Merged,
        error,
        provenance: Some(Provenance {
            original_sources,
            merged_from: group.members.len(),
            merged_criteria: criteria,
            unresolved,
        }),
    }
}

// ── Duplicate analysis ──

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub upc: String,
    pub count: usize,
    pub origins: Vec<String>,
    pub names: Vec<String>,
    pub brands: Vec<String>,
    pub images: Vec<String>,
    pub min_price: Price,
    pub max_price: Price,
    pub same_name: bool,
    pub same_brand: bool,
    pub same_price: bool,
    pub same_image: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateReport {
    pub total_products: usize,
    pub with_upc: usize,
    pub without_upc: usize,
    pub unique_upcs: usize,
    pub duplicate_groups: usize,
    pub duplicated_records: usize,
    pub groups: Vec<DuplicateGroup>,
}

impl DuplicateReport {
    pub fn print(&self) {
        println!("Products:          {}", self.total_products);
        println!("With UPC:          {}", self.with_upc);
        println!("Without UPC:       {}", self.without_upc);
        println!("Unique UPCs:       {}", self.unique_upcs);
        println!("Duplicate groups:  {}", self.duplicate_groups);
        println!("Records in groups: {}", self.duplicated_records);

        let mut conflicts = [0usize; 4];
        for g in &self.groups {
            for (n, same) in conflicts
                .iter_mut()
                .zip([g.same_name, g.same_brand, g.same_price, g.same_image])
            {
                *n += !same as usize;
            }
        }
        println!(
            "Conflicts: name {}, brand {}, price {}, image {}",
            conflicts[0], conflicts[1], conflicts[2], conflicts[3]
        );

        for g in self.groups.iter().take(10) {
            println!(
                "  {} x{} [{}] {}..{}",
                g.upc,
                g.count,
                g.origins.join(", "),
                g.min_price,
                g.max_price
            );
        }
    }
}

fn distinct(members: &[&Product], get: Field) -> Vec<String> {
    members.iter().filter_map(|p| get(p)).unique().cloned().collect()
}

/// Describe every UPC shared by more than one product. Read-only.
pub fn analyze_duplicates(products: &[Product]) -> DuplicateReport {
    let (no_identity, groups) = group_by_upc(products);

    let dupes: Vec<DuplicateGroup> = groups
        .iter()
        .filter(|g| g.members.len() > 1)
        .map(|g| {
            let names = distinct(&g.members, |p| p.name.as_ref());
            let brands = distinct(&g.members, |p| p.brand.as_ref());
            let images = distinct(&g.members, |p| p.source_image_url.as_ref());
            let (min_price, max_price) = g
                .members
                .iter()
                .map(|p| p.price)
                .minmax()
                .into_option()
                .unwrap_or((Price::ZERO, Price::ZERO));
            DuplicateGroup {
                upc: g.upc.to_string(),
                count: g.members.len(),
                origins: g.members.iter().map(|p| p.source.to_string()).unique().collect(),
                same_name: names.len() <= 1,
                same_brand: brands.len() <= 1,
                same_price: min_price == max_price,
                same_image: images.len() <= 1,
                names,
                brands,
                images,
                min_price,
                max_price,
            }
        })
        .collect();

    DuplicateReport {
        total_products: products.len(),
        with_upc: products.len() - no_identity.len(),
        without_upc: no_identity.len(),
        unique_upcs: groups.len(),
        duplicate_groups: dupes.len(),
        duplicated_records: dupes.iter().map(|g| g.count).sum(),
        groups: dupes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OriginProfile;
    use crate::model::RawRecord;
    use crate::normalize::normalize_batch;

    fn product(origin: &str, upc: Option<&str>, name: Option<&str>, cents: u64) -> Product {
        let url = format!("https://{}/{}", origin, name.unwrap_or("x"));
        Product {
            id: format!("{}_{}", origin, upc.unwrap_or("none")),
            name: name.map(str::to_string),
            brand: None,
            upc: upc.map(str::to_string),
            price: Price::from_cents(cents),
            source_image_url: None,
            source_url: Some(url),
            source_urls: vec![],
            source: Source::Origin(origin.to_string()),
            error: None,
            provenance: None,
        }
    }

    fn policy(primary: &str, image: &str) -> MergePolicy {
        MergePolicy {
            primary: primary.to_string(),
            image: image.to_string(),
        }
    }

    #[test]
    fn cheapest_positive_price_wins() {
        let products = vec![
            product("a", Some("123456"), Some("X"), 1250),
            product("b", Some("123456"), Some("X"), 999),
            product("c", Some("123456"), Some("X"), 1500),
        ];
        let (out, stats) = merge(&products, &policy("a", "b"), "t");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].price, Price::from_cents(999));
        assert_eq!(out[0].provenance.as_ref().unwrap().merged_criteria["price"], "b");
        assert_eq!(stats.records_removed, 2);
    }

    #[test]
    fn lone_brand_wins_without_primary() {
        let mut with_brand = product("b", Some("777777"), Some("Y"), 100);
        with_brand.brand = Some("Acme".into());
        let products = vec![product("c", Some("777777"), Some("Y"), 100), with_brand];
        let (out, _) = merge(&products, &policy("a", "z"), "t");
        assert_eq!(out[0].brand.as_deref(), Some("Acme"));
        assert_eq!(out[0].provenance.as_ref().unwrap().merged_criteria["brand"], "b");
    }

    #[test]
    fn image_prefers_image_origin_then_primary() {
        let mut a = product("a", Some("555555"), Some("N"), 100);
        a.source_image_url = Some("https://a/img.png".into());
        let mut b = product("b", Some("555555"), Some("N"), 100);
        b.source_image_url = Some("https://b/img.png".into());
        let (out, _) = merge(&[a.clone(), b.clone()], &policy("a", "b"), "t");
        assert_eq!(out[0].source_image_url.as_deref(), Some("https://b/img.png"));

        b.source_image_url = None;
        let (out, _) = merge(&[b, a], &policy("a", "b"), "t");
        assert_eq!(out[0].source_image_url.as_deref(), Some("https://a/img.png"));
    }

    #[test]
    fn output_order_and_urls() {
        let products = vec![
            product("b", Some("111111"), Some("one"), 100),
            product("a", None, Some("loose"), 100),
            product("a", Some("222222"), Some("two"), 100),
            product("a", Some("111111"), Some("uno"), 200),
        ];
        let (out, stats) = merge(&products, &policy("a", "b"), "tok");
        let ids: Vec<&str> = out.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a_none", "a_222222", "merged_111111_tok"]);
        assert_eq!(
            out[2].source_urls,
            vec!["https://a/uno".to_string(), "https://b/one".to_string()]
        );
        assert_eq!(out[2].name.as_deref(), Some("uno"));
        assert_eq!(stats.no_identity, 1);
        assert_eq!(stats.output, 3);
    }

    #[test]
    fn repeated_runs_agree() {
        let products: Vec<Product> = (0..40)
            .map(|i| {
                let upc = format!("{:06}", i % 7);
                product(["a", "b", "c"][i % 3], Some(&upc), Some("n"), 100 + (i as u64 % 5))
            })
            .collect();
        let (first, _) = merge(&products, &policy("b", "c"), "t");
        let (second, _) = merge(&products, &policy("b", "c"), "t");
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn all_zero_prices_are_unresolved() {
        let products = vec![
            product("a", Some("999999"), None, 0),
            product("b", Some("999999"), None, 0),
        ];
        let (out, _) = merge(&products, &policy("a", "b"), "t");
        let prov = out[0].provenance.as_ref().unwrap();
        assert!(out[0].price.is_zero());
        assert_eq!(prov.unresolved, vec!["price", "name"]);
        assert!(!prov.merged_criteria.contains_key("price"));
    }

    #[test]
    fn cookie_scenario_end_to_end() {
        let profile = OriginProfile::default();
        let a = vec![RawRecord::new("https://a/cookie", "A")
            .with_field("upc", "123456")
            .with_field("name", "Cookie")
            .with_field("brand", "Acme")
            .with_field("price", "S/ 5.00")];
        let b = vec![RawRecord::new("https://b/cookie", "B")
            .with_field("upc", "123456")
            .with_field("name", "Cookie X")
            .with_field("brand", serde_json::Value::Null)
            .with_field("price", 4.5)];

        let (mut products, _) = normalize_batch("A", &profile, &a);
        products.extend(normalize_batch("B", &profile, &b).0);

        let (out, _) = merge(&products, &policy("A", "B"), "t");
        assert_eq!(out.len(), 1);
        let m = &out[0];
        assert_eq!(m.name.as_deref(), Some("Cookie"));
        assert_eq!(m.brand.as_deref(), Some("Acme"));
        assert_eq!(m.price, Price::from_cents(450));
        assert_eq!(m.provenance.as_ref().unwrap().original_sources, vec!["A", "B"]);
        assert!(m.is_merged());
    }

    #[test]
    fn duplicate_report_flags_conflicts() {
        let mut b = product("b", Some("123456"), Some("Other"), 300);
        b.brand = Some("Acme".into());
        let products = vec![
            product("a", Some("123456"), Some("Same"), 100),
            b,
            product("a", Some("654321"), Some("Solo"), 100),
            product("a", None, None, 0),
        ];
        let report = analyze_duplicates(&products);
        assert_eq!(report.without_upc, 1);
        assert_eq!(report.unique_upcs, 2);
        assert_eq!(report.duplicate_groups, 1);
        let g = &report.groups[0];
        assert_eq!(g.origins, vec!["a", "b"]);
        assert!(!g.same_name);
        assert!(g.same_brand);
        assert_eq!((g.min_price.cents(), g.max_price.cents()), (100, 300));
    }
}
